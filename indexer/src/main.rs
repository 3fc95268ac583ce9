mod api;
mod cli;
mod metrics;
mod rpc;
mod stats;
mod storage;
mod sync;
#[cfg(test)]
mod test_utils;

use api::ApiState;
use cli::IndexerConfig;
use eyre::{eyre, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rpc::HttpRpc;
use stats::IndexerStats;
use std::{io::IsTerminal, sync::Arc};
use storage::Storage;
use sync::ProgressReporter;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

impl ProgressReporter for ProgressBar {
    fn set_length(&self, len: u64) {
        self.set_length(len);
    }

    fn inc(&self, delta: u64) {
        self.inc(delta);
    }

    fn finish(&self) {
        self.finish_and_clear();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = IndexerConfig::from_args();
    init_tracing(&config.log_level);
    config.validate()?;

    info!(
        rpc = %config.rpc.as_ref().expect("validated"),
        contract = %config.contract.expect("validated"),
        topic = %config.topic.expect("validated"),
        start_block = config.start_block,
        end_block = config.end_block,
        workers = config.workers,
        "starting event indexer"
    );

    let prometheus = metrics::install_recorder()?;
    let storage = Arc::new(Storage::open(
        &config.db_path,
        &format!("{:#x}", config.contract.expect("validated")),
        &format!("{:#x}", config.topic.expect("validated")),
    )?);
    let stats = Arc::new(IndexerStats::new(config.start_block, config.end_block_opt()));
    if let Some(checkpoint) = storage.load_checkpoint()? {
        stats.seed_from_checkpoint(&checkpoint);
    }

    let rpc = Arc::new(HttpRpc::new(&config, Arc::clone(&stats))?);
    let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);

    let api_state = Arc::new(ApiState {
        storage: Arc::clone(&storage),
        stats: Arc::clone(&stats),
        live: live_tx.clone(),
        prometheus,
    });
    let mut api_handle = Some(spawn_server(
        config.api_addr,
        api::router(Arc::clone(&api_state)),
        stop_rx.clone(),
    ));
    let mut metrics_handle = Some(spawn_server(
        config.metrics_addr,
        api::metrics_router(api_state),
        stop_rx.clone(),
    ));

    let progress: Option<Arc<dyn ProgressReporter>> = if std::io::stderr().is_terminal() {
        let bar = ProgressBar::new(0);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        let style = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} | {elapsed_precise} | {msg}",
        )
        .expect("progress style");
        bar.set_style(style);
        bar.set_message("backfilling");
        Some(Arc::new(bar))
    } else {
        None
    };

    let mut ingest_handle = tokio::spawn(sync::run_ingest(
        rpc,
        Arc::clone(&storage),
        stats,
        live_tx,
        config.clone(),
        progress,
        stop_rx,
    ));

    let mut ingest_done = false;
    let outcome: Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
            Ok(())
        }
        result = &mut ingest_handle => {
            ingest_done = true;
            match flatten_join(result) {
                Ok(()) => {
                    info!("ingest complete; serving queries until shutdown");
                    let _ = tokio::signal::ctrl_c().await;
                    Ok(())
                }
                Err(err) => {
                    warn!(error = %err, "ingest failed");
                    Err(err)
                }
            }
        }
    };

    let _ = stop_tx.send(true);
    let shutdown = async {
        if !ingest_done {
            let _ = ingest_handle.await;
        }
        if let Some(handle) = api_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = metrics_handle.take() {
            let _ = handle.await;
        }
    };
    if timeout(config.shutdown_timeout(), shutdown).await.is_err() {
        warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "graceful shutdown timed out; exiting anyway"
        );
    }
    drop(storage);

    match &outcome {
        Ok(()) => info!("shutdown complete"),
        Err(_) => warn!("shutdown complete after fatal error"),
    }
    outcome
}

fn spawn_server(
    addr: std::net::SocketAddr,
    app: axum::Router,
    stop_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = api::serve(addr, app, stop_rx).await {
            tracing::error!(addr = %addr, error = %err, "http server failed");
        }
    })
}

fn flatten_join(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(join_err) => Err(eyre!("ingest task panicked: {join_err}")),
    }
}

fn init_tracing(log_level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!("warn,event_indexer={log_level}")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
