use anyhow::Context;
use geocode_backfill::{init_tracing, run_backfill, AppConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling geocode backfill");
                cancel.cancel();
            }
        });
    }

    let stats = run_backfill(&config, &cancel)
        .await
        .context("geocode backfill did not complete")?;
    info!(
        resolved = stats.resolved,
        skipped = stats.skipped,
        provider_calls = stats.provider_calls,
        "done"
    );
    Ok(())
}
