//! Drives a running `server_polls` with many concurrent voters on one poll
//! while a WebSocket viewer watches, then checks that the final tally counts
//! every voter exactly once and that the viewer never went backwards.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the poll server
    #[clap(long, default_value = "http://127.0.0.1:9010")]
    url: String,

    /// Number of distinct voters
    #[clap(short, long, default_value_t = 100)]
    voters: usize,

    /// Number of options on the test poll
    #[clap(short, long, default_value_t = 3)]
    options: usize,

    /// Votes in flight at once
    #[clap(short, long, default_value_t = 50)]
    concurrency: usize,

    /// Resubmissions of a vote answered with a retryable error
    #[clap(long, default_value_t = 5)]
    retries: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TallyRow {
    option_id: String,
    text: String,
    vote_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollView {
    id: String,
    version: u64,
    total_votes: u64,
    tally: Vec<TallyRow>,
}

#[derive(Debug, Deserialize)]
struct LiveMessage {
    #[serde(rename = "type")]
    msg_type: String,
    poll: Option<PollView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(default)]
    retryable: bool,
    /// Prior choice, present on 409 answers.
    option_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.options < 2 {
        bail!("a poll needs at least 2 options");
    }
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/').to_string();

    // 1. Create the poll
    let option_texts: Vec<String> = (1..=args.options).map(|i| format!("Option {i}")).collect();
    let poll: PollView = client
        .post(format!("{base}/polls"))
        .json(&json!({ "question": "Throughput test", "options": option_texts }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("Created poll {} with {} options", poll.id, poll.tally.len());

    // 2. Attach a viewer
    let ws_url = format!("{}/polls/{}/ws", base.replacen("http", "ws", 1), poll.id);
    let (ws_stream, _) = connect_async(&ws_url)
        .await
        .with_context(|| format!("Failed to connect to {ws_url}"))?;
    let (_write, mut read) = ws_stream.split();
    let expected_version = args.voters as u64;

    let viewer = tokio::spawn(async move {
        let mut seen: Vec<u64> = Vec::new();
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                let Ok(parsed) = serde_json::from_str::<LiveMessage>(&text) else {
                    continue;
                };
                if parsed.msg_type != "snapshot" {
                    continue;
                }
                if let Some(poll) = parsed.poll {
                    seen.push(poll.version);
                    if poll.version >= expected_version {
                        break;
                    }
                }
            }
        }
        seen
    });

    // 3. Vote
    let run_id = Utc::now().timestamp_millis();
    let option_ids: Arc<Vec<String>> = Arc::new(poll.tally.iter().map(|row| row.option_id.clone()).collect());
    let permits = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.voters);
    for i in 0..args.voters {
        let client = client.clone();
        let url = format!("{base}/polls/{}/vote", poll.id);
        let option_id = option_ids[i % option_ids.len()].clone();
        let voter = format!("load-{run_id}-{i}");
        let permits = Arc::clone(&permits);
        let retries = args.retries;
        handles.push(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            cast_vote(&client, &url, &voter, &option_id, retries).await
        }));
    }

    let mut failures = 0;
    for handle in handles {
        if let Err(e) = handle.await? {
            eprintln!("Vote failed: {e:#}");
            failures += 1;
        }
    }
    let elapsed = started.elapsed();
    println!(
        "{} votes in {:.2?} ({:.0} votes/s), {} failed",
        args.voters,
        elapsed,
        args.voters as f64 / elapsed.as_secs_f64(),
        failures
    );
    if failures > 0 {
        bail!("{failures} of {} votes were not accepted", args.voters);
    }

    // 4. Check the viewer and the tally
    let seen = timeout(Duration::from_secs(10), viewer)
        .await
        .context("Viewer never received the final version")??;
    if !seen.windows(2).all(|w| w[0] < w[1]) {
        bail!("Viewer saw versions out of order: {seen:?}");
    }
    println!("Viewer received {} snapshots, last version {:?}", seen.len(), seen.last());

    let final_poll: PollView = client
        .get(format!("{base}/polls/{}", poll.id))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    for row in &final_poll.tally {
        println!("  {}: {}", row.text, row.vote_count);
    }
    if final_poll.total_votes != expected_version || final_poll.version != expected_version {
        bail!(
            "Tally mismatch: {} votes cast, total {} at version {}",
            expected_version,
            final_poll.total_votes,
            final_poll.version
        );
    }
    println!("OK: every vote counted exactly once");
    Ok(())
}

async fn cast_vote(
    client: &reqwest::Client,
    url: &str,
    voter: &str,
    option_id: &str,
    retries: u32,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let response = client
            .post(url)
            .header("x-voter-id", voter)
            .json(&json!({ "optionId": option_id }))
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
            error: status.to_string(),
            retryable: false,
            option_id: None,
        });
        // An earlier attempt committed even though its answer was an error.
        if attempt > 0
            && status == reqwest::StatusCode::CONFLICT
            && body.option_id.as_deref() == Some(option_id)
        {
            return Ok(());
        }
        if !body.retryable || attempt >= retries {
            bail!("{voter}: {status} {}", body.error);
        }
        attempt += 1;
        sleep(Duration::from_millis(50 * u64::from(attempt))).await;
    }
}
