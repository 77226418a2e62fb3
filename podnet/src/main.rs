use std::process::ExitCode;

use clap::Parser;
use podnet::config::{Args, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let args = Args::parse();

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let result = match args.command {
        Command::Master(master_args) => podnet::master::run(master_args, cancel).await,
        Command::Node(node_args) => {
            let ready = CancellationToken::new();
            podnet::node::run(node_args, ready, cancel).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn watch_signals(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received interrupt, shutting down");
        cancel.cancel();
    }
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podnet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
