// Job registry: process-wide status of processing jobs
//
// One writer per entry (the worker holding the current ticket), any number of
// concurrent readers. A single coarse lock guards the whole map so a snapshot
// never mixes fields from two different updates.

use crate::pipeline::types::{JobSnapshot, JobStatus};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Highest progress a job can report while still processing. Only
/// [`JobRegistry::complete`] moves a job to 100.
pub const MAX_IN_FLIGHT_PROGRESS: f64 = 99.9;

struct JobEntry {
    generation: u64,
    status: JobStatus,
    progress: f64,
    output: Option<String>,
    error: Option<String>,
    cancel: Arc<AtomicBool>,
    finished_at: Option<Instant>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            status: self.status,
            progress: self.progress,
            output: self.output.clone(),
            error: self.error.clone(),
        }
    }
}

/// Write ownership of one registry entry.
///
/// Handed out by [`JobRegistry::create`]. Once a newer upload re-creates the
/// same key, every write made through the old ticket is ignored.
#[derive(Debug, Clone)]
pub struct JobTicket {
    key: String,
    generation: u64,
    cancel: Arc<AtomicBool>,
}

impl JobTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unique per `create` call; used to keep file names of concurrent
    /// jobs for the same key apart.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
    next_generation: AtomicU64,
    ttl: Duration,
}

impl JobRegistry {
    /// `ttl` is how long a terminal job stays visible before eviction.
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            ttl,
        }
    }

    /// Start tracking `key` as processing at 0%. Replaces any previous entry
    /// for the same key and signals its worker to stop.
    pub fn create(&self, key: &str) -> JobTicket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let entry = JobEntry {
            generation,
            status: JobStatus::Processing,
            progress: 0.0,
            output: None,
            error: None,
            cancel: cancel.clone(),
            finished_at: None,
        };

        let previous = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);

        if let Some(previous) = previous {
            tracing::info!(
                "Job {} re-created (generation {} replaces {})",
                key,
                generation,
                previous.generation
            );
            previous.cancel.store(true, Ordering::Relaxed);
        }

        JobTicket {
            key: key.to_string(),
            generation,
            cancel,
        }
    }

    /// Raise the progress of a processing job. Values are clamped to
    /// `[0, MAX_IN_FLIGHT_PROGRESS]` and never lower the stored progress.
    /// Returns `false` when the key is missing, the ticket is stale or the job
    /// is already terminal.
    pub fn update_progress(&self, ticket: &JobTicket, progress: f64) -> bool {
        self.with_current_entry(ticket, |entry| {
            if entry.status != JobStatus::Processing {
                return false;
            }
            let progress = if progress.is_finite() {
                progress.clamp(0.0, MAX_IN_FLIGHT_PROGRESS)
            } else {
                0.0
            };
            if progress > entry.progress {
                entry.progress = progress;
            }
            true
        })
    }

    /// Mark the job complete and record its output file name.
    ///
    /// `publish` moves the finished file into place. It runs under the
    /// registry lock and only while `ticket` is current, so a superseded
    /// worker can never replace the output of a newer job. The entry is left
    /// untouched when `publish` fails.
    pub fn complete(
        &self,
        ticket: &JobTicket,
        output: &str,
        publish: impl FnOnce() -> io::Result<()>,
    ) -> io::Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = current_entry(&mut jobs, ticket) else {
            return Ok(false);
        };
        publish()?;
        entry.status = JobStatus::Complete;
        entry.progress = 100.0;
        entry.output = Some(output.to_string());
        entry.error = None;
        entry.finished_at = Some(Instant::now());
        Ok(true)
    }

    /// Mark the job failed. Progress is left where the worker stopped.
    pub fn fail(&self, ticket: &JobTicket, reason: &str) -> bool {
        self.with_current_entry(ticket, |entry| {
            entry.status = JobStatus::Failed;
            entry.error = Some(reason.to_string());
            entry.finished_at = Some(Instant::now());
            true
        })
    }

    pub fn get(&self, key: &str) -> JobSnapshot {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(JobEntry::snapshot)
            .unwrap_or_else(JobSnapshot::unknown)
    }

    /// Ask the worker of an in-flight job to stop at the next frame.
    pub fn cancel(&self, key: &str) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(key) {
            Some(entry) if entry.status == JobStatus::Processing => {
                entry.cancel.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Take the output of a complete job. Only the first caller gets it.
    ///
    /// `detach` receives the output name and the job generation and runs
    /// under the registry lock; it should move the file out of the way of
    /// later jobs for the same key. The output is only taken when `detach`
    /// succeeds.
    pub fn claim_output<T>(
        &self,
        key: &str,
        detach: impl FnOnce(&str, u64) -> io::Result<T>,
    ) -> Option<io::Result<T>> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs.get_mut(key)?;
        if entry.status != JobStatus::Complete {
            return None;
        }
        let output = entry.output.as_deref()?;
        let detached = detach(output, entry.generation);
        if detached.is_ok() {
            entry.output = None;
        }
        Some(detached)
    }

    /// Drop terminal entries older than the TTL. Returns the output files of
    /// evicted jobs that were never downloaded.
    pub fn evict_expired(&self) -> Vec<String> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, entry)| {
                entry.status.is_terminal()
                    && entry
                        .finished_at
                        .map(|at| at.elapsed() >= ttl)
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut orphaned = Vec::new();
        for key in expired {
            if let Some(entry) = jobs.remove(&key) {
                tracing::debug!("Evicted job {} ({})", key, entry.status);
                orphaned.extend(entry.output);
            }
        }
        orphaned
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn with_current_entry(&self, ticket: &JobTicket, f: impl FnOnce(&mut JobEntry) -> bool) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        current_entry(&mut jobs, ticket).map(f).unwrap_or(false)
    }
}

fn current_entry<'a>(
    jobs: &'a mut HashMap<String, JobEntry>,
    ticket: &JobTicket,
) -> Option<&'a mut JobEntry> {
    match jobs.get_mut(&ticket.key) {
        Some(entry) if entry.generation == ticket.generation => Some(entry),
        Some(_) => {
            tracing::debug!(
                "Ignoring write from stale ticket {} for job {}",
                ticket.generation,
                ticket.key
            );
            None
        }
        None => {
            tracing::debug!("Ignoring write for missing job {}", ticket.key);
            None
        }
    }
}

/// Periodically evict expired jobs and delete their undownloaded outputs.
pub async fn run_evictor(registry: Arc<JobRegistry>, output_root: PathBuf, every: Duration) {
    tracing::info!("Starting job evictor (interval: {:?})", every);
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;

        let orphaned = registry.evict_expired();
        if !orphaned.is_empty() {
            tracing::debug!("{} jobs tracked after eviction", registry.len());
        }

        for output in orphaned {
            let path = output_root.join(&output);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::info!("Deleted expired output {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to delete expired output {:?}: {}", path, e),
            }
        }
    }
}
