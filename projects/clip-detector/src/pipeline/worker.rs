// Processing worker: decode → detect → encode for one job
//
// Each job runs on its own OS thread. The worker is the only writer of its
// registry entry; failures are recorded there and never reach the server.

use crate::pipeline::detection::Detector;
use crate::pipeline::registry::{JobRegistry, JobTicket};
use crate::video::{VideoBackend, VideoReader, VideoWriter};
use anyhow::anyhow;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Output frame rate of server jobs, independent of the source rate.
pub const DEFAULT_OUTPUT_FPS: f64 = 30.0;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("processing cancelled")]
    Cancelled,

    #[error("processing exceeded the time limit of {0:?}")]
    TimedOut(Duration),

    #[error("video contains no decodable frames")]
    NoFrames,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Receives progress after every written frame. `progress` is `None` when the
/// source did not report a frame count.
pub trait ProgressReporter {
    fn report(&mut self, processed: usize, progress: Option<f64>);
}

impl<F> ProgressReporter for F
where
    F: FnMut(usize, Option<f64>),
{
    fn report(&mut self, processed: usize, progress: Option<f64>) {
        self(processed, progress)
    }
}

/// Stop conditions checked once per frame.
pub struct RunControl {
    cancel: Arc<AtomicBool>,
    started: Instant,
    max_duration: Option<Duration>,
}

impl RunControl {
    pub fn new(cancel: Arc<AtomicBool>, max_duration: Option<Duration>) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            max_duration,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)), None)
    }

    fn check(&self) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(PipelineError::Cancelled);
        }
        if let Some(limit) = self.max_duration {
            if self.started.elapsed() >= limit {
                return Err(PipelineError::TimedOut(limit));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProcessingStats {
    pub processed_frames: usize,
    pub duration: Duration,
}

pub fn progress_percent(processed: usize, total: usize) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((processed as f64 / total as f64 * 100.0).min(100.0))
}

/// Annotate every frame of `reader` into `writer`, strictly in source order.
///
/// The writer is finished on success. On error both ends are left to their
/// owner, whose drop releases them.
pub fn annotate_video<P>(
    reader: &mut dyn VideoReader,
    writer: &mut dyn VideoWriter,
    detector: &dyn Detector,
    control: &RunControl,
    mut reporter: P,
) -> Result<ProcessingStats, PipelineError>
where
    P: ProgressReporter,
{
    let start_time = Instant::now();
    let total_frames = reader.frame_count()?;
    let mut processed_frames = 0;

    loop {
        control.check()?;

        let Some(frame) = reader.next_frame()? else {
            break;
        };

        let annotated = detector.annotate(&frame)?;
        writer.write_frame(&annotated)?;

        processed_frames += 1;
        reporter.report(
            processed_frames,
            progress_percent(processed_frames, total_frames),
        );
    }

    if processed_frames == 0 {
        return Err(PipelineError::NoFrames);
    }

    writer.finish()?;

    Ok(ProcessingStats {
        processed_frames,
        duration: start_time.elapsed(),
    })
}

pub fn output_file_name(input_name: &str) -> String {
    format!("processed_{}", input_name)
}

/// Everything a worker needs to process one upload.
pub struct JobSpec {
    pub ticket: JobTicket,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub output_fps: f64,
    pub max_duration: Option<Duration>,
}

impl JobSpec {
    pub fn output_name(&self) -> String {
        output_file_name(self.ticket.key())
    }

    /// Where a completed job's output is published.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(self.output_name())
    }

    /// Where this job writes while processing. Unique per ticket so a
    /// superseded worker never shares a file with its replacement. Keeps the
    /// output extension, which selects the container.
    pub fn partial_path(&self) -> PathBuf {
        self.output_dir
            .join(format!(".{}-{}", self.ticket.generation(), self.output_name()))
    }
}

/// Run one job to completion on the current thread and record the outcome.
pub fn run_job(
    spec: &JobSpec,
    backend: &dyn VideoBackend,
    detector: &dyn Detector,
    registry: &JobRegistry,
) -> Result<ProcessingStats, PipelineError> {
    let key = spec.ticket.key();
    let partial_path = spec.partial_path();
    tracing::info!(
        "Processing job {}: {:?} -> {:?}",
        key,
        spec.input_path,
        partial_path
    );

    let stats = match annotate_job(spec, &partial_path, backend, detector, registry) {
        Ok(stats) => stats,
        Err(e) => {
            let reason = format!("{:#}", e);
            match e {
                PipelineError::Cancelled => tracing::info!("Job {} cancelled", key),
                _ => tracing::error!("Job {} failed: {}", key, reason),
            }
            record_failure(spec, registry, &reason);
            return Err(e);
        }
    };

    let output_path = spec.output_path();
    let published = registry.complete(&spec.ticket, &spec.output_name(), || {
        fs::rename(&partial_path, &output_path)
    });

    match published {
        Ok(true) => {
            tracing::info!(
                "Job {} complete: {} frames in {:.2}s -> {:?}",
                key,
                stats.processed_frames,
                stats.duration.as_secs_f64(),
                output_path
            );
            Ok(stats)
        }
        Ok(false) => {
            tracing::warn!("Job {} finished after being superseded", key);
            remove_partial(&partial_path);
            Ok(stats)
        }
        Err(e) => {
            let reason = format!("failed to publish output: {}", e);
            tracing::error!("Job {} {}", key, reason);
            record_failure(spec, registry, &reason);
            Err(PipelineError::Backend(anyhow!(reason)))
        }
    }
}

// Reader and writer are dropped (released) before this returns on every path.
fn annotate_job(
    spec: &JobSpec,
    partial_path: &Path,
    backend: &dyn VideoBackend,
    detector: &dyn Detector,
    registry: &JobRegistry,
) -> Result<ProcessingStats, PipelineError> {
    let mut reader = backend.open_reader(&spec.input_path)?;
    let size = reader.frame_size()?;
    let mut writer = backend.open_writer(partial_path, size, spec.output_fps)?;

    let control = RunControl::new(spec.ticket.cancel_flag(), spec.max_duration);
    annotate_video(
        reader.as_mut(),
        writer.as_mut(),
        detector,
        &control,
        |_processed: usize, progress: Option<f64>| {
            if let Some(progress) = progress {
                registry.update_progress(&spec.ticket, progress);
            }
        },
    )
}

fn record_failure(spec: &JobSpec, registry: &JobRegistry, reason: &str) {
    registry.fail(&spec.ticket, reason);
    remove_partial(&spec.partial_path());
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed partial output {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial output {:?}: {}", path, e),
    }
}

/// Start a job on a dedicated thread. A panic inside the pipeline is caught
/// and recorded as a failure.
pub fn spawn_job(
    spec: JobSpec,
    backend: Arc<dyn VideoBackend>,
    detector: Arc<dyn Detector>,
    registry: Arc<JobRegistry>,
) -> anyhow::Result<JoinHandle<()>> {
    let key = spec.ticket.key().to_string();
    thread::Builder::new()
        .name(format!("job-{}", key))
        .spawn(move || {
            tracing::debug!("Spawned worker for job {}", key);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run_job(&spec, backend.as_ref(), detector.as_ref(), &registry)
            }));

            if outcome.is_err() {
                tracing::error!("Worker for job {} panicked", key);
                record_failure(&spec, &registry, "worker panicked");
            }
        })
        .map_err(|e| anyhow!("Failed to spawn worker thread: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{
        solid_frame, FakeBackend, FakeReader, RecordingWriter, StampDetector, WriterLog,
    };
    use crate::pipeline::types::{JobSnapshot, JobStatus};
    use opencv::core::Size;
    use std::sync::Mutex;

    fn spec(registry: &JobRegistry, key: &str, output_dir: &Path) -> JobSpec {
        JobSpec {
            ticket: registry.create(key),
            input_path: PathBuf::from(format!("uploads/{}", key)),
            output_dir: output_dir.to_path_buf(),
            output_fps: DEFAULT_OUTPUT_FPS,
            max_duration: None,
        }
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 0), None);
        assert_eq!(progress_percent(5, 0), None);
        assert_eq!(progress_percent(1, 4), Some(25.0));
        assert_eq!(progress_percent(4, 4), Some(100.0));
        // Containers can under-report
        assert_eq!(progress_percent(6, 4), Some(100.0));
    }

    #[test]
    fn test_every_frame_detected_and_written_in_order() {
        let size = Size::new(10, 10);
        let mut reader = FakeReader::new(5, size);
        let log = WriterLog::default();
        let mut writer = RecordingWriter::new(log.clone());
        let detector = StampDetector::default();
        let mut reports = Vec::new();

        let stats = annotate_video(
            &mut reader,
            &mut writer,
            &detector,
            &RunControl::unbounded(),
            |processed: usize, progress: Option<f64>| reports.push((processed, progress)),
        )
        .unwrap();

        assert_eq!(stats.processed_frames, 5);
        assert_eq!(detector.call_count(), 5);
        assert_eq!(log.markers(), vec![1, 2, 3, 4, 5]);
        assert!(log.finished.load(Ordering::SeqCst));

        let progress: Vec<f64> = reports.iter().map(|(_, p)| p.unwrap()).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(progress[..4].iter().all(|p| *p < 100.0));
        assert_eq!(progress[4], 100.0);
        assert_eq!(reports.last().unwrap().0, 5);
    }

    #[test]
    fn test_unknown_frame_count_reports_indeterminate() {
        let mut reader = FakeReader::new(3, Size::new(10, 10)).reporting(0);
        let mut writer = RecordingWriter::new(WriterLog::default());
        let mut reports = Vec::new();

        annotate_video(
            &mut reader,
            &mut writer,
            &StampDetector::default(),
            &RunControl::unbounded(),
            |_processed: usize, progress: Option<f64>| reports.push(progress),
        )
        .unwrap();

        assert_eq!(reports, vec![None, None, None]);
    }

    #[test]
    fn test_empty_source_is_an_error() {
        let mut reader = FakeReader::new(0, Size::new(10, 10));
        let log = WriterLog::default();
        let mut writer = RecordingWriter::new(log.clone());

        let result = annotate_video(
            &mut reader,
            &mut writer,
            &StampDetector::default(),
            &RunControl::unbounded(),
            |_: usize, _: Option<f64>| {},
        );

        assert!(matches!(result, Err(PipelineError::NoFrames)));
        assert!(!log.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_stops_before_next_frame() {
        let mut reader = FakeReader::new(3, Size::new(10, 10));
        let mut writer = RecordingWriter::new(WriterLog::default());
        let detector = StampDetector::default();
        let control = RunControl::new(Arc::new(AtomicBool::new(true)), None);

        let result = annotate_video(
            &mut reader,
            &mut writer,
            &detector,
            &control,
            |_: usize, _: Option<f64>| {},
        );

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(detector.call_count(), 0);
    }

    #[test]
    fn test_deadline_stops_processing() {
        let mut reader = FakeReader::new(3, Size::new(10, 10));
        let mut writer = RecordingWriter::new(WriterLog::default());
        let control = RunControl::new(Arc::new(AtomicBool::new(false)), Some(Duration::ZERO));

        let result = annotate_video(
            &mut reader,
            &mut writer,
            &StampDetector::default(),
            &control,
            |_: usize, _: Option<f64>| {},
        );

        assert!(matches!(result, Err(PipelineError::TimedOut(_))));
    }

    #[test]
    fn test_run_job_three_frame_clip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let backend = FakeBackend::new(3);
        let detector = StampDetector::default();
        let spec = spec(&registry, "clip.mp4", dir.path());

        let stats = run_job(&spec, &backend, &detector, &registry).unwrap();
        assert_eq!(stats.processed_frames, 3);

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Complete);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.output.as_deref(), Some("processed_clip.mp4"));

        let opened = backend.log.opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        let (path, size, fps) = &opened[0];
        assert_eq!(path, &spec.partial_path());
        assert!(!spec.partial_path().exists());
        assert_eq!(*size, Size::new(10, 10));
        // Source reports 25 fps; output is always written at 30
        assert_eq!(*fps, 30.0);
        assert_eq!(backend.log.markers(), vec![1, 2, 3]);
        assert!(backend.log.dropped.load(Ordering::SeqCst));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("processed_clip.mp4")).unwrap(),
            "frames=3"
        );
    }

    #[test]
    fn test_run_job_zero_reported_frames_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let mut backend = FakeBackend::new(2);
        backend.reported = Some(0);
        let spec = spec(&registry, "clip.mp4", dir.path());

        run_job(&spec, &backend, &StampDetector::default(), &registry).unwrap();

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Complete);
        assert_eq!(snap.progress, 100.0);
    }

    #[test]
    fn test_run_job_without_frames_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let backend = FakeBackend::new(0);
        let spec = spec(&registry, "clip.mp4", dir.path());

        let result = run_job(&spec, &backend, &StampDetector::default(), &registry);
        assert!(matches!(result, Err(PipelineError::NoFrames)));

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(
            snap.error.as_deref(),
            Some("video contains no decodable frames")
        );
        assert!(!dir.path().join("processed_clip.mp4").exists());
    }

    #[test]
    fn test_run_job_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let mut backend = FakeBackend::new(3);
        backend.fail_open = true;
        let spec = spec(&registry, "clip.mp4", dir.path());

        assert!(run_job(&spec, &backend, &StampDetector::default(), &registry).is_err());
        assert_eq!(registry.get("clip.mp4").status, JobStatus::Failed);
        assert!(backend.log.opened.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_job_detector_error_releases_writer() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let backend = FakeBackend::new(3);
        let detector = StampDetector::failing_on(2);
        let spec = spec(&registry, "clip.mp4", dir.path());

        assert!(run_job(&spec, &backend, &detector, &registry).is_err());

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Failed);
        assert!((snap.progress - 100.0 / 3.0).abs() < 1e-9);
        assert!(snap.error.unwrap().contains("inference failed"));
        assert!(backend.log.dropped.load(Ordering::SeqCst));
        assert!(!backend.log.finished.load(Ordering::SeqCst));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_spawn_job_survives_panics() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(60)));
        let spec = spec(&registry, "clip.mp4", dir.path());

        let handle = spawn_job(
            spec,
            Arc::new(FakeBackend::new(3)),
            Arc::new(StampDetector::panicking_on(1)),
            registry.clone(),
        )
        .unwrap();
        handle.join().unwrap();

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("worker panicked"));
    }

    #[test]
    fn test_superseded_job_leaves_new_entry_alone() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let old = spec(&registry, "clip.mp4", dir.path());
        let _new = registry.create("clip.mp4");

        // The old worker sees its cancel flag and stops
        let result = run_job(&old, &FakeBackend::new(3), &StampDetector::default(), &registry);
        assert!(matches!(result, Err(PipelineError::Cancelled)));

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Processing);
        assert_eq!(snap.progress, 0.0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_superseded_writer_never_touches_new_output() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Duration::from_secs(60));
        let old = spec(&registry, "clip.mp4", dir.path());
        let new = spec(&registry, "clip.mp4", dir.path());
        assert_ne!(old.partial_path(), new.partial_path());

        // Old job is mid-frame while the new one starts writing
        let old_backend = FakeBackend::new(3);
        let mut old_writer = old_backend
            .open_writer(&old.partial_path(), Size::new(10, 10), DEFAULT_OUTPUT_FPS)
            .unwrap();
        old_writer.write_frame(&solid_frame(9, Size::new(10, 10))).unwrap();

        let new_backend = FakeBackend::new(3);
        run_job(&new, &new_backend, &StampDetector::default(), &registry).unwrap();

        // The old job notices cancellation; its writer closes its own file
        drop(old_writer);
        let result = run_job(&old, &old_backend, &StampDetector::default(), &registry);
        assert!(matches!(result, Err(PipelineError::Cancelled)));

        assert_eq!(
            std::fs::read_to_string(dir.path().join("processed_clip.mp4")).unwrap(),
            "frames=3"
        );
        assert!(!old.partial_path().exists());
        assert!(!new.partial_path().exists());

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Complete);
        assert_eq!(snap.output.as_deref(), Some("processed_clip.mp4"));
    }

    #[test]
    fn test_under_reported_frame_count_holds_progress_below_full() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(60)));
        let mut backend = FakeBackend::new(6);
        backend.reported = Some(4);
        let spec = spec(&registry, "clip.mp4", dir.path());
        let detector = SnapshotDetector {
            registry: registry.clone(),
            seen: Mutex::new(Vec::new()),
        };

        run_job(&spec, &backend, &detector, &registry).unwrap();

        let seen = detector.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 6);
        for snap in &seen {
            assert_eq!(snap.status, JobStatus::Processing);
            assert!(snap.progress < 100.0, "progress {} while processing", snap.progress);
        }
        assert!(seen.windows(2).all(|w| w[0].progress <= w[1].progress));

        let snap = registry.get("clip.mp4");
        assert_eq!(snap.status, JobStatus::Complete);
        assert_eq!(snap.progress, 100.0);
    }

    /// Passes frames through, recording the job as pollers see it before
    /// each frame.
    struct SnapshotDetector {
        registry: Arc<JobRegistry>,
        seen: Mutex<Vec<JobSnapshot>>,
    }

    impl Detector for SnapshotDetector {
        fn annotate(&self, frame: &opencv::core::Mat) -> anyhow::Result<opencv::core::Mat> {
            self.seen
                .lock()
                .unwrap()
                .push(self.registry.get("clip.mp4"));
            Ok(frame.clone())
        }
    }
}
