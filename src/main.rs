use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use coreutils_rt::http::{BatchHandle, FetchRequest, HttpClient, HttpDataFetcher};
use coreutils_rt::lifecycle::CoreContext;
use coreutils_rt::{logging, CoreConfig, CoreError, Limits};

#[derive(Parser)]
#[command(name = "coreutils-fetch")]
#[command(about = "Fetch many resources concurrently into a directory")]
struct Cli {
    /// Base URL. Each id is appended as a path segment unless --query-param is set.
    base_url: String,

    #[arg(required = true)]
    ids: Vec<String>,

    /// Send each id as this query parameter instead of a path segment.
    #[arg(long, env = "FETCH_QUERY_PARAM")]
    query_param: Option<String>,

    #[arg(long, default_value = "")]
    prefix: String,

    #[arg(long, default_value = "")]
    suffix: String,

    #[arg(long, env, default_value_os_t = default_output_dir())]
    output_dir: PathBuf,

    #[arg(long, env = "FETCH_CONCURRENCY", default_value = "8")]
    concurrency: usize,

    /// Cancel whatever is still pending after this many seconds. 0 = no limit.
    #[arg(long, env = "FETCH_TIMEOUT", default_value = "0")]
    timeout: u64,

    /// Also write the JSON summary to this file.
    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env, default_value = "2000")]
    lock_timeout_ms: u64,

    #[arg(long, env, default_value_t = Limits::available_processors())]
    max_pool_size: usize,

    #[arg(long, env, default_value = "60000")]
    keep_alive_ms: u64,

    #[arg(long, env, default_value = "5000")]
    termination_timeout_ms: u64,
}

fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coreutils-rt")
        .join("fetch")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = CoreConfig {
        lock_timeout_ms: cli.lock_timeout_ms,
        max_pool_size: cli.max_pool_size,
        keep_alive_ms: cli.keep_alive_ms,
        termination_timeout_ms: cli.termination_timeout_ms,
        fetch_concurrency: cli.concurrency,
    };
    let context = CoreContext::init(config.clone())?;

    let client = HttpClient::shared(context.registry())?;
    let fetcher = HttpDataFetcher::with_client(client.inner().clone(), config.fetch_concurrency());

    let mut request = FetchRequest::new(&cli.base_url, cli.ids, &cli.output_dir)
        .prefix(cli.prefix)
        .suffix(cli.suffix);
    if let Some(param) = cli.query_param {
        request = request.query_param(param);
    }

    let batch = match fetcher.fetch_to_dir(request).await {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!("{}", e);
            teardown(&context).await;
            std::process::exit(2);
        }
    };

    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        res = wait_for_batch(&batch, cli.timeout) => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, cancelling fetch batch");
            batch.cancel();
            batch.outcome().await?;
        },
        _ = async {
            #[cfg(unix)]
            {
                terminate.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::info!("Received SIGTERM, cancelling fetch batch");
            batch.cancel();
            batch.outcome().await?;
        }
    }

    let summary = batch.summary();
    let json = serde_json::to_string_pretty(&summary)?;
    println!("{}", json);

    if let Some(path) = cli.manifest {
        let written = context
            .pool()
            .submit(move || std::fs::write(&path, json.as_bytes()).map(|_| path))
            .await;
        match written {
            Ok(Ok(path)) => tracing::info!(path = %path.display(), "Manifest written"),
            Ok(Err(e)) => tracing::error!("Failed to write manifest: {}", e),
            Err(e) => tracing::error!("Manifest task failed: {}", e),
        }
    }

    teardown(&context).await;

    if !summary.all_completed() {
        tracing::warn!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Not every item was fetched"
        );
        std::process::exit(1);
    }
    Ok(())
}

async fn wait_for_batch(batch: &BatchHandle, timeout_secs: u64) -> coreutils_rt::Result<()> {
    if timeout_secs == 0 {
        batch.outcome().await?;
        return Ok(());
    }
    match batch.outcome_timeout(Duration::from_secs(timeout_secs)).await {
        Ok(_) => Ok(()),
        Err(CoreError::Timeout(after)) => {
            tracing::warn!(
                timeout_sec = after.as_secs(),
                "Fetch batch timed out, cancelling remaining items"
            );
            batch.cancel();
            batch.outcome().await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn teardown(context: &std::sync::Arc<CoreContext>) {
    let context = context.clone();
    match tokio::task::spawn_blocking(move || context.teardown()).await {
        Ok(report) => {
            for (name, outcome) in report.iter().filter(|(_, o)| !o.is_stopped()) {
                tracing::warn!(participant = %name, outcome = ?outcome, "Participant did not stop cleanly");
            }
            tracing::info!(participants = report.len(), "Shutdown complete");
        }
        Err(e) => tracing::error!("Shutdown sequence panicked: {}", e),
    }
}
