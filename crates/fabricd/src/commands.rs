//! One-shot commands: open the engine, replay overrides, snapshot, plan.

use std::path::{Path, PathBuf};

use anyhow::Context;
use fabric_core::EngineConfig;
use fabric_engine::{Engine, EngineError};
use fabric_overrides::OverrideLog;
use fabric_placement::{Job, StrategyKind};
use fabric_state::{FabricDescriptor, SnapshotArchive};
use serde_json::json;
use tracing::{info, warn};

/// Build the engine from a descriptor, attaching and restoring from an
/// archive when one is given.
pub fn open_engine(
    fabric: &Path,
    config: EngineConfig,
    archive: Option<&Path>,
) -> anyhow::Result<Engine> {
    let descriptor = FabricDescriptor::from_file(fabric)
        .with_context(|| format!("loading fabric descriptor {}", fabric.display()))?;
    let mut engine = Engine::from_descriptor(&descriptor, config)?;
    if let Some(path) = archive {
        let archive = SnapshotArchive::open(path)
            .with_context(|| format!("opening archive {}", path.display()))?;
        engine = engine.with_archive(archive);
        let restored = engine.restore_policies()?;
        info!(path = %path.display(), restored, "archive attached");
    }
    Ok(engine)
}

/// Apply every event currently in `path` as one batch.
pub async fn replay_overrides(engine: &Engine, path: &Path) -> anyhow::Result<()> {
    let mut log = OverrideLog::new(path);
    let batch = log.read_new().await?;
    if batch.malformed > 0 {
        warn!(path = %path.display(), malformed = batch.malformed, "skipped malformed overrides");
    }
    let report = engine.store().apply_overrides(batch.events)?;
    for (event_id, reason) in &report.rejected {
        warn!(%event_id, %reason, "override rejected");
    }
    info!(
        applied = report.applied.len(),
        unchanged = report.unchanged.len(),
        version = report.version,
        "override log replayed"
    );
    Ok(())
}

pub async fn snapshot(engine: &Engine, overrides: Option<&Path>, overview: bool) -> anyhow::Result<()> {
    if let Some(path) = overrides {
        replay_overrides(engine, path).await?;
    }
    let snap = engine.get_snapshot();
    let out = if overview {
        json!({
            "version": snap.version,
            "federations": snap.federation_overview(),
        })
    } else {
        serde_json::to_value(&*snap)?
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    if engine.archive_snapshot().is_ok() {
        info!(version = snap.version, "snapshot archived");
    }
    Ok(())
}

pub async fn plan(
    engine: &Engine,
    jobs: &[PathBuf],
    strategy: &str,
    dry_run: bool,
    overrides: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(path) = overrides {
        replay_overrides(engine, path).await?;
    }
    let kind = StrategyKind::parse(strategy);
    let mut loaded = Vec::with_capacity(jobs.len());
    for path in jobs {
        let mut job = Job::from_file(path)
            .with_context(|| format!("loading job {}", path.display()))?;
        job.constraints.dry_run |= dry_run;
        loaded.push(job);
    }

    let mut failures = 0usize;
    for (job, result) in loaded.iter().zip(engine.plan_batch(&loaded, &kind)) {
        let line = match result {
            Ok(outcome) => serde_json::to_value(&outcome)?,
            Err(e) => {
                failures += 1;
                failure_json(&job.id, &e)
            }
        };
        println!("{}", serde_json::to_string_pretty(&line)?);
    }

    match engine.checkpoint_policies() {
        Ok(saved) => info!(saved, "policies checkpointed"),
        Err(EngineError::NoArchive) => {}
        Err(e) => warn!(error = %e, "policy checkpoint failed"),
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} jobs were not placed", loaded.len());
    }
    Ok(())
}

fn failure_json(job_id: &str, error: &EngineError) -> serde_json::Value {
    json!({
        "job_id": job_id,
        "phase": error.phase().map(|p| p.to_string()),
        "retryable": error.is_retryable(),
        "error": error.to_string(),
    })
}
