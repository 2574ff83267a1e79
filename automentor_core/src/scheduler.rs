/// Background trigger loop
///
/// Polls the orchestrator for due triggers on a fixed interval and runs
/// memory maintenance after each pass. The loop owns one thread; `stop()`
/// is observed within one sleep chunk.
use crate::agent::orchestrator::{FiredTrigger, Orchestrator, TriggerOutcome};
use crate::error::{AgentError, AgentResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SLEEP_CHUNKS: u32 = 60;
const MAX_STORED_PASSES: usize = 100;

/// Summary of one polling pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPass {
    pub ran_at: chrono::DateTime<Utc>,
    pub fired: usize,
    pub degraded: usize,
    pub skipped: usize,
}

impl LoopPass {
    fn new(fired: &[FiredTrigger]) -> Self {
        let degraded = fired
            .iter()
            .filter(|f| matches!(f.outcome, TriggerOutcome::Degraded { .. }))
            .count();
        let skipped = fired
            .iter()
            .filter(|f| matches!(f.outcome, TriggerOutcome::Skipped { .. }))
            .count();
        Self {
            ran_at: Utc::now(),
            fired: fired.len(),
            degraded,
            skipped,
        }
    }
}

pub struct OrchestratorLoop {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    enabled: bool,
    running: Arc<AtomicBool>,
    passes: Arc<Mutex<Vec<LoopPass>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OrchestratorLoop {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = orchestrator.config();
        let interval = Duration::from_secs(config.poll_interval_secs);
        let enabled = config.enabled;
        log::info!("[ORCH] Initializing loop (interval: {:?}, enabled: {})", interval, enabled);
        Self {
            orchestrator,
            interval,
            enabled,
            running: Arc::new(AtomicBool::new(false)),
            passes: Arc::new(Mutex::new(Vec::new())),
            handle: Mutex::new(None),
        }
    }

    /// Override the polling interval, mainly for tests
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn start(&self) -> AgentResult<()> {
        if !self.enabled {
            return Err(AgentError::invalid_state("orchestrator loop is disabled in configuration"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::invalid_state("orchestrator loop is already running"));
        }

        let running = Arc::clone(&self.running);
        let passes = Arc::clone(&self.passes);
        let orchestrator = Arc::clone(&self.orchestrator);
        let chunk = (self.interval / SLEEP_CHUNKS).max(Duration::from_millis(10));

        let handle = thread::Builder::new()
            .name("automentor-orchestrator".to_string())
            .spawn(move || {
                log::info!("[ORCH] Background thread started");
                while running.load(Ordering::Relaxed) {
                    let now = Utc::now();
                    let fired = orchestrator.run_due(now);
                    if let Err(e) = orchestrator.maintain(now) {
                        log::error!("[ORCH] Memory maintenance failed: {}", e);
                    }

                    {
                        let mut guard = passes.lock().unwrap_or_else(|e| e.into_inner());
                        guard.push(LoopPass::new(&fired));
                        if guard.len() > MAX_STORED_PASSES {
                            guard.remove(0);
                        }
                    }

                    for _ in 0..SLEEP_CHUNKS {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        thread::sleep(chunk);
                    }
                }
                log::info!("[ORCH] Background thread stopped");
            })?;

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Signal the loop to stop and wait for the thread to exit
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            log::info!("[ORCH] Stopping loop");
        }
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[ORCH] Loop thread panicked");
            }
        }
    }

    pub fn passes(&self) -> Vec<LoopPass> {
        self.passes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for OrchestratorLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
