use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use poll_core::{OptionId, PollError, StoreError, VoteError};
use serde_json::json;

/// Everything a handler can fail with.
#[derive(Debug)]
pub enum ApiError {
    Vote(VoteError),
    Poll(PollError),
}

impl From<VoteError> for ApiError {
    fn from(err: VoteError) -> Self {
        ApiError::Vote(err)
    }
}

impl From<PollError> for ApiError {
    fn from(err: PollError) -> Self {
        ApiError::Poll(err)
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
        StoreError::Conflict | StoreError::InvalidWrite(_) | StoreError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Vote(err) => match err {
                VoteError::PollNotFound => StatusCode::NOT_FOUND,
                VoteError::AlreadyVoted { .. } => StatusCode::CONFLICT,
                VoteError::InvalidOption => StatusCode::UNPROCESSABLE_ENTITY,
                VoteError::Contention => StatusCode::SERVICE_UNAVAILABLE,
                VoteError::Unauthenticated => StatusCode::UNAUTHORIZED,
                VoteError::Store(store) => store_status(store),
            },
            ApiError::Poll(PollError::Store(store)) => store_status(store),
            ApiError::Poll(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    fn retryable(&self) -> bool {
        match self {
            ApiError::Vote(err) => err.is_retryable(),
            ApiError::Poll(PollError::Store(StoreError::Unavailable(_))) => true,
            ApiError::Poll(_) => false,
        }
    }

    fn prior_choice(&self) -> Option<&OptionId> {
        match self {
            ApiError::Vote(VoteError::AlreadyVoted { option_id }) => Some(option_id),
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Vote(err) => err.to_string(),
            ApiError::Poll(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.message(), "Request failed");
        }

        let mut body = json!({
            "error": self.message(),
            "retryable": self.retryable(),
        });
        if let Some(option_id) = self.prior_choice() {
            body["optionId"] = json!(option_id);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_errors_map_to_statuses() {
        let cases = [
            (VoteError::PollNotFound, StatusCode::NOT_FOUND),
            (
                VoteError::AlreadyVoted { option_id: "Red".into() },
                StatusCode::CONFLICT,
            ),
            (VoteError::InvalidOption, StatusCode::UNPROCESSABLE_ENTITY),
            (VoteError::Contention, StatusCode::SERVICE_UNAVAILABLE),
            (VoteError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (
                VoteError::Store(StoreError::Unavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(ApiError::from(VoteError::Contention).retryable());
        assert!(!ApiError::from(VoteError::InvalidOption).retryable());
        assert!(!ApiError::from(PollError::TooFewOptions(1)).retryable());
    }

    #[test]
    fn already_voted_carries_prior_choice() {
        let err = ApiError::from(VoteError::AlreadyVoted { option_id: "Blue".into() });
        assert_eq!(err.prior_choice(), Some(&OptionId::from("Blue")));
        assert_eq!(ApiError::from(VoteError::PollNotFound).prior_choice(), None);
    }
}
