use serde::Serialize;
use std::fmt;

/// Axis-aligned bounding box in pixel coordinates of the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A single detection produced by the model, after confidence filtering.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: usize,
    pub class_name: Option<String>,
}

impl Detection {
    /// Text drawn above the box, e.g. `person 0.87`.
    pub fn label(&self) -> String {
        match &self.class_name {
            Some(name) => format!("{} {:.2}", name, self.confidence),
            None => format!("class {} {:.2}", self.class_id, self.confidence),
        }
    }
}

/// Lifecycle of a processing job as seen by polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Complete,
    Failed,
    /// Reported for keys the registry has never seen (or has evicted).
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }

    /// No further updates are expected once a job is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a job entry, taken under the registry lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn unknown() -> Self {
        Self {
            status: JobStatus::Unknown,
            progress: 0.0,
            output: None,
            error: None,
        }
    }
}
