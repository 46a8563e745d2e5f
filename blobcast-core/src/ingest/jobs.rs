use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Receiving,
    Probing,
    Planning,
    Uploading,
    Committing,
    Done,
    Error,
}

/// Progress snapshot returned by `/api/upload/{job}/progress`.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub video_id: Option<String>,
    pub phase: JobPhase,
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub rate_bps: u64,
    pub eta_s: Option<u64>,
    pub percent: f64,
    pub error: Option<String>,
}

struct JobEntry {
    progress: JobProgress,
    phase_started: Instant,
}

/// In-memory registry of upload jobs, owned by the application object.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
    counter: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create(self: &Arc<Self>) -> JobTracker {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let job_id = format!("job-{sequence:06}");
        let progress = JobProgress {
            job_id: job_id.clone(),
            video_id: None,
            phase: JobPhase::Receiving,
            current_bytes: 0,
            total_bytes: 0,
            rate_bps: 0,
            eta_s: None,
            percent: 0.0,
            error: None,
        };
        self.jobs.lock().expect("job registry lock").insert(
            job_id.clone(),
            JobEntry {
                progress,
                phase_started: Instant::now(),
            },
        );
        JobTracker {
            registry: Arc::clone(self),
            job_id,
        }
    }

    pub fn get(&self, job_id: &str) -> Option<JobProgress> {
        self.jobs
            .lock()
            .expect("job registry lock")
            .get(job_id)
            .map(|entry| entry.progress.clone())
    }

    fn update<F>(&self, job_id: &str, f: F)
    where
        F: FnOnce(&mut JobEntry),
    {
        if let Some(entry) = self.jobs.lock().expect("job registry lock").get_mut(job_id) {
            f(entry);
        }
    }
}

/// Writer handle for one job's progress.
#[derive(Clone)]
pub struct JobTracker {
    registry: Arc<JobRegistry>,
    job_id: String,
}

impl JobTracker {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn set_video(&self, video_id: &str) {
        self.registry.update(&self.job_id, |entry| {
            entry.progress.video_id = Some(video_id.to_string());
        });
    }

    pub fn set_phase(&self, phase: JobPhase) {
        self.registry.update(&self.job_id, |entry| {
            entry.progress.phase = phase;
            entry.progress.current_bytes = 0;
            entry.progress.total_bytes = 0;
            entry.progress.rate_bps = 0;
            entry.progress.eta_s = None;
            entry.progress.percent = match phase {
                JobPhase::Done => 100.0,
                _ => entry.progress.percent,
            };
            entry.phase_started = Instant::now();
        });
    }

    pub fn set_total_bytes(&self, total: u64) {
        self.registry.update(&self.job_id, |entry| {
            entry.progress.total_bytes = total;
        });
    }

    /// Update transferred bytes for the current phase; rate and ETA are
    /// derived from the phase start.
    pub fn set_current_bytes(&self, current: u64) {
        self.registry.update(&self.job_id, |entry| {
            entry.progress.current_bytes = current;
            let elapsed = entry.phase_started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                entry.progress.rate_bps = (current as f64 * 8.0 / elapsed) as u64;
            }
            if entry.progress.total_bytes > 0 {
                entry.progress.percent =
                    (current as f64 / entry.progress.total_bytes as f64 * 100.0).min(100.0);
                let remaining = entry.progress.total_bytes.saturating_sub(current);
                let rate_bytes = current as f64 / elapsed.max(1e-6);
                if rate_bytes > 0.0 {
                    entry.progress.eta_s = Some((remaining as f64 / rate_bytes) as u64);
                }
            }
        });
    }

    pub fn finish(&self) {
        self.set_phase(JobPhase::Done);
    }

    pub fn fail(&self, message: &str) {
        let message = message.to_string();
        self.registry.update(&self.job_id, |entry| {
            entry.progress.phase = JobPhase::Error;
            entry.progress.error = Some(message);
        });
    }
}
