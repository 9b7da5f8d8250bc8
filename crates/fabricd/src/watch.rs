//! `watch` — run the override merger in the foreground.

use std::path::PathBuf;
use std::time::Duration;

use fabric_engine::Engine;
use fabric_overrides::{MergerHandle, OverrideMerger};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::info;

pub async fn run(engine: Engine, overrides: Option<PathBuf>, report_ms: u64) -> anyhow::Result<()> {
    let mut config = engine.config().merger.clone();
    if overrides.is_some() {
        config.override_log = overrides;
    }
    if config.override_log.is_none() {
        info!("no override log configured, merging pushed events and sweeping TTLs only");
    }

    // Keep the sender alive so the pushed-event branch stays open.
    let (merger, _events) = OverrideMerger::new(engine.store().clone(), config);
    let handle = merger.spawn();

    report_until(
        &engine,
        &handle,
        Duration::from_millis(report_ms.max(1)),
        tokio::signal::ctrl_c(),
    )
    .await?;

    let stats = handle.stats().await;
    handle.stop().await?;
    if let Err(e) = engine.archive_snapshot() {
        info!(error = %e, "snapshot not archived");
    }
    engine.shutdown()?;
    info!(
        applied = stats.applied,
        rejected = stats.rejected,
        malformed = stats.malformed,
        expired_released = stats.expired_released,
        "watch finished"
    );
    Ok(())
}

/// Print one line per new snapshot version until `shutdown` resolves or
/// the merger exits.
async fn report_until(
    engine: &Engine,
    handle: &MergerHandle,
    every: Duration,
    shutdown: impl Future<Output = std::io::Result<()>>,
) -> anyhow::Result<()> {
    let mut report = tokio::time::interval(every);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut last_version = None;
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                info!("shutdown signal received");
                return Ok(());
            }
            _ = report.tick() => {
                if handle.is_finished() {
                    info!("override merger exited on its own");
                    return Ok(());
                }
                let snap = engine.get_snapshot();
                if last_version != Some(snap.version) {
                    last_version = Some(snap.version);
                    let line = json!({
                        "version": snap.version,
                        "reservations": snap.reservations.len(),
                        "federations": snap.federation_overview(),
                    });
                    println!("{}", serde_json::to_string(&line)?);
                }
            }
        }
    }
}
