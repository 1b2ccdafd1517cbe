use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use glass_client::{connection, ExecutionRegistry, Outcome};
use protocol::ProbeCommand;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "glass", version, about = "Run a looking glass probe and stream its output")]
struct Args {
    #[arg(long, default_value = "ws://127.0.0.1:8000/ws")]
    url: String,
    /// Give up when no final message arrives in time, e.g. after a silently
    /// dropped rate-limited request.
    #[arg(long, default_value = "5m 30s", value_parser = humantime::parse_duration)]
    timeout: Duration,
    /// ping, ping6, host, traceroute4 or traceroute6
    command: ProbeCommand,
    target: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing();

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
    let registry = Arc::new(ExecutionRegistry::new(request_tx));
    let cancel = CancellationToken::new();
    let connection = tokio::spawn(connection::run(
        args.url.clone(),
        Arc::clone(&registry),
        request_rx,
        cancel.clone(),
    ));

    let id = registry.submit(args.command, &args.target).await?;
    let mut subscription = registry
        .subscribe(&id)
        .context("execution missing right after submit")?;
    let expiry = {
        let registry = Arc::clone(&registry);
        let id = id.clone();
        let limit = args.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            registry.expire(&id);
        })
    };
    while let Some(line) = subscription.next().await {
        println!("{line}");
    }
    let outcome = subscription.outcome();
    expiry.abort();

    cancel.cancel();
    let _ = connection.await;

    Ok(match outcome {
        Some(Outcome::Completed) => ExitCode::SUCCESS,
        Some(Outcome::Failed) => {
            eprintln!("{} {} was rejected by the server", args.command, args.target);
            ExitCode::FAILURE
        }
        Some(Outcome::RateLimited) => {
            eprintln!("rate limited, try again in a few seconds");
            ExitCode::FAILURE
        }
        Some(Outcome::TimedOut) => {
            eprintln!(
                "no result from {} within {}",
                args.url,
                humantime::format_duration(args.timeout)
            );
            ExitCode::FAILURE
        }
        Some(Outcome::Disconnected) | None => {
            eprintln!("connection to {} lost", args.url);
            ExitCode::FAILURE
        }
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
