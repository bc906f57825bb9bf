// Offline single-file processing with a terminal progress bar

use crate::cli::ProcessArgs;
use crate::pipeline::detection::{Detector, ModelDetector};
use crate::pipeline::worker::{annotate_video, ProcessingStats, RunControl, DEFAULT_OUTPUT_FPS};
use crate::video::{OpencvBackend, VideoBackend};
use anyhow::Result;
use chrono::{DateTime, Local};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};

pub struct OfflineRun {
    pub output_path: PathBuf,
    pub stats: ProcessingStats,
}

/// `processed_video_<YYYY-MM-DD_HH-MM-SS>.mp4`
pub fn timestamped_output_name(now: DateTime<Local>) -> String {
    format!("processed_video_{}.mp4", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Annotate `input` into a new timestamped file under `output_dir`, keeping
/// the source frame rate.
pub fn process_file(
    backend: &dyn VideoBackend,
    detector: &dyn Detector,
    input: &Path,
    output_dir: &Path,
    now: DateTime<Local>,
) -> Result<OfflineRun> {
    fs::create_dir_all(output_dir)?;

    let mut reader = backend.open_reader(input)?;
    let total_frames = reader.frame_count()?;
    let size = reader.frame_size()?;
    let mut fps = reader.source_fps()?;
    if fps <= 0.0 {
        tracing::warn!("No source FPS for {:?}, falling back to {}", input, DEFAULT_OUTPUT_FPS);
        fps = DEFAULT_OUTPUT_FPS;
    }
    println!(
        "Total Frames: {}, FPS: {:.2}, Resolution: {}x{}",
        total_frames, fps, size.width, size.height
    );

    let output_path = output_dir.join(timestamped_output_name(now));
    let mut writer = backend.open_writer(&output_path, size, fps)?;

    let pb = if total_frames > 0 {
        ProgressBar::new(total_frames as u64)
    } else {
        ProgressBar::new_spinner()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")?
            .progress_chars("#>-"),
    );

    let result = annotate_video(
        reader.as_mut(),
        writer.as_mut(),
        detector,
        &RunControl::unbounded(),
        |processed: usize, _progress: Option<f64>| pb.set_position(processed as u64),
    );

    match result {
        Ok(stats) => {
            pb.finish_with_message("Done");
            Ok(OfflineRun { output_path, stats })
        }
        Err(e) => {
            pb.abandon();
            drop(writer);
            if let Err(rm) = fs::remove_file(&output_path) {
                tracing::warn!("Failed to remove partial output {:?}: {}", output_path, rm);
            }
            Err(e.into())
        }
    }
}

/// Entry point of the `process` subcommand.
pub fn run_offline(args: ProcessArgs) -> Result<()> {
    let detector = ModelDetector::new(&args.model.model, args.model.min_confidence)?;
    let run = process_file(
        &OpencvBackend,
        &detector,
        &args.input,
        &args.output_dir,
        Local::now(),
    )?;

    println!(
        "Processed {} frames in {:.1}s",
        run.stats.processed_frames,
        run.stats.duration.as_secs_f64()
    );
    println!("Output video saved to {}", run.output_path.display());
    Ok(())
}
