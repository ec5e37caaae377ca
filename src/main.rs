use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

mod api_client;
mod board;
mod clock;
mod config;
mod palette;
mod queue;
mod target;
mod worker;

use api_client::ApiClient;
use board::BoardClient;
use clock::SystemClock;
use config::Config;
use palette::Palette;
use queue::PixelQueue;
use target::TargetImage;
use worker::{PacingConfig, PlacementWorker};

#[derive(Parser, Debug)]
#[command(name = "placebot", about = "Multi-account pixel placement bot")]
struct Cli {
    /// Be verbose
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "placebot=debug,info"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::info!("placebot started");

    if !Path::new(".env").exists() {
        match config::write_env_template(Path::new(".env")) {
            Ok(()) => tracing::error!(
                "no .env found; a template has been created, fill it in before rerunning"
            ),
            Err(err) => tracing::error!(error = %err, "no .env found and writing a template failed"),
        }
        return ExitCode::FAILURE;
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            tracing::error!(error = %err, "cannot determine working directory");
            return ExitCode::FAILURE;
        }
    };
    let (target, target_path) = match TargetImage::load_from_dir(&cwd) {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::error!(error = %err, "cannot load target image");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        path = %target_path.display(),
        width = target.width(),
        height = target.height(),
        "loaded target image"
    );

    let target = Arc::new(target);
    let palette = Arc::new(Palette::standard());
    let queue = Arc::new(PixelQueue::new(
        Arc::clone(&target),
        palette,
        config.draw_origin,
        config.staleness_secs,
    ));
    let fetcher = Arc::new(BoardClient::new(config.canvas_ws_url.clone()));
    let pacing = PacingConfig {
        poll_secs: config.poll_secs,
        backoff_min_secs: config.backoff_min_secs,
        backoff_max_secs: config.backoff_max_secs,
    };

    // One task per account, launched with a stagger so the credential
    // exchanges don't all land on the service at once. A misconfigured
    // account is reported and skipped; the rest still run.
    let mut handles = Vec::new();
    for index in 0..config.account_count() {
        let setup = match config.account(index) {
            Ok(setup) => setup,
            Err(err) => {
                tracing::error!(account = index, error = %err, "worker not started");
                continue;
            }
        };
        let api = ApiClient::new(config.auth_base_url.clone(), config.gql_base_url.clone());
        let worker = PlacementWorker::new(
            index,
            setup,
            config.draw_origin,
            (target.width(), target.height()),
            pacing,
            api,
            SystemClock,
        );
        let queue = Arc::clone(&queue);
        let fetcher = Arc::clone(&fetcher);
        handles.push(tokio::spawn(async move { worker.run(queue, fetcher).await }));
        tokio::time::sleep(Duration::from_secs(config.launch_delay_secs)).await;
    }

    if handles.is_empty() {
        tracing::error!("no workers could be started");
        return ExitCode::FAILURE;
    }

    let mut total_placed = 0u64;
    for handle in handles {
        match handle.await {
            Ok(placed) => total_placed += placed,
            Err(err) => tracing::error!(error = %err, "worker task panicked"),
        }
    }
    tracing::info!(total_placed, "all workers finished, image complete");
    ExitCode::SUCCESS
}
