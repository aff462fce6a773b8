use std::time::Instant;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::{BackendRegistry, Engine, VoiceParams};
use crate::workers::WorkerPool;

const WARMUP_TEXT: &str = "Ready.";

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupReport {
    pub warmed: Vec<Engine>,
    pub failed: Vec<(Engine, String)>,
}

/// Completion handle for [`spawn_warmup`]. Dropping it leaves the task running.
pub struct WarmupHandle {
    rx: oneshot::Receiver<WarmupReport>,
}

impl WarmupHandle {
    pub async fn finished(self) -> Option<WarmupReport> {
        self.rx.await.ok()
    }
}

/// Runs one short synthesis per backend in the background so the first real
/// request does not pay for model loading.
pub fn spawn_warmup(registry: BackendRegistry, pool: WorkerPool) -> WarmupHandle {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut report = WarmupReport::default();
        for backend in registry.iter().cloned() {
            let engine = backend.engine();
            let started = Instant::now();
            let result = pool
                .run(move || {
                    let voice = backend.voices().into_iter().next().unwrap_or_default();
                    backend.synthesize(WARMUP_TEXT, &VoiceParams::new(voice, 1.0))
                })
                .await;
            match result {
                Ok(Ok(_)) => {
                    info!(%engine, elapsed_ms = started.elapsed().as_millis() as u64, "Backend warmed up");
                    report.warmed.push(engine);
                }
                Ok(Err(err)) => {
                    warn!(%engine, ?err, "Backend warm-up failed");
                    report.failed.push((engine, err.to_string()));
                }
                Err(err) => {
                    warn!(%engine, ?err, "Backend warm-up crashed");
                    report.failed.push((engine, format!("{err:#}")));
                }
            }
        }
        let _ = tx.send(report);
    });
    WarmupHandle { rx }
}
