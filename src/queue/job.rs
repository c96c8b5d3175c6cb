//! Extraction jobs and their lifecycle

use crate::fusion::FusionStrategy;
use crate::pipeline::ExtractionOutcome;
use crate::provider::ImagePayload;
use crate::schema::{AttributeSchema, ProductContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Job lifecycle: pending → processing → completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status only moves forward; nothing re-enters pending.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// Why a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Not enough token budget left in the window at dispatch
    BudgetExceeded,
    /// The pipeline and every fallback provider failed
    AllProvidersFailed,
    /// The image could not be read or decoded
    ImageUnavailable,
    /// The process stopped while the job was running
    Interrupted,
}

impl FailureKind {
    /// Whether resubmitting the same job later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BudgetExceeded | Self::Interrupted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn budget_exceeded(needed: u64, remaining: u64) -> Self {
        Self::new(
            FailureKind::BudgetExceeded,
            format!(
                "budget exceeded: job needs ~{} tokens, {} remaining in window",
                needed, remaining
            ),
        )
    }
}

/// Where the job's image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ImageRef {
    /// Base64 bytes carried with the job
    Inline { mime_type: String, data: String },
    /// File read when the job is dispatched
    Path { path: PathBuf },
}

impl ImageRef {
    pub fn inline(payload: &ImagePayload) -> Self {
        Self::Inline {
            mime_type: payload.mime_type.clone(),
            data: payload.to_base64(),
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    /// Load the image bytes
    pub async fn resolve(&self) -> Result<ImagePayload, JobFailure> {
        match self {
            Self::Inline { mime_type, data } => ImagePayload::from_base64(mime_type.clone(), data)
                .map_err(|e| {
                    JobFailure::new(FailureKind::ImageUnavailable, format!("invalid base64 image: {}", e))
                }),
            Self::Path { path } => {
                let data = tokio::fs::read(path).await.map_err(|e| {
                    JobFailure::new(
                        FailureKind::ImageUnavailable,
                        format!("cannot read image {}: {}", path.display(), e),
                    )
                })?;
                Ok(ImagePayload::new(mime_for_path(path), data))
            }
        }
    }
}

/// MIME type guessed from the file extension
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

/// What a caller hands to the scheduler
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub image: ImageRef,
    pub schema: AttributeSchema,
    pub context: ProductContext,
    /// Requested priority; the scheduler may override it
    pub priority: Priority,
    /// Caller identity, checked against the privileged list
    pub submitter: Option<String>,
    pub discovery: bool,
    pub fusion: Option<FusionStrategy>,
}

impl JobSubmission {
    pub fn new(image: ImageRef, schema: AttributeSchema) -> Self {
        Self {
            image,
            schema,
            context: ProductContext::default(),
            priority: Priority::Normal,
            submitter: None,
            discovery: false,
            fusion: None,
        }
    }

    pub fn with_context(mut self, context: ProductContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn submitted_by(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    pub fn with_discovery(mut self, discovery: bool) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_fusion(mut self, strategy: FusionStrategy) -> Self {
        self.fusion = Some(strategy);
        self
    }
}

/// A job as recorded by the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionJob {
    pub id: JobId,
    pub image: ImageRef,
    pub schema: AttributeSchema,
    #[serde(default)]
    pub context: ProductContext,
    #[serde(default)]
    pub discovery: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fusion: Option<FusionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    pub priority: Priority,
    pub estimated_cost: u64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
}

impl ExtractionJob {
    /// A pending job with its scheduling fields already decided
    pub fn new(
        submission: JobSubmission,
        priority: Priority,
        estimated_cost: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            image: submission.image,
            schema: submission.schema,
            context: submission.context,
            discovery: submission.discovery,
            fusion: submission.fusion,
            submitter: submission.submitter,
            priority,
            estimated_cost,
            status: JobStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            processing_duration_ms: None,
        }
    }

    /// Apply a lifecycle update, refusing backward moves
    pub fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next = update.status();
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }

        match update {
            JobUpdate::Processing => {
                self.started_at = Some(now);
            }
            JobUpdate::Completed(outcome) => {
                self.result = Some(*outcome);
            }
            JobUpdate::Failed(failure) => {
                self.error = Some(failure);
            }
        }

        if next.is_terminal() {
            if let Some(started) = self.started_at {
                let elapsed = (now - started).num_milliseconds().max(0);
                self.processing_duration_ms = Some(elapsed as u64);
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Provider cost actually spent, once completed
    pub fn actual_cost(&self) -> Option<u64> {
        self.result.as_ref().map(|r| r.resource_cost)
    }
}

/// A status change for a stored job
#[derive(Debug, Clone)]
pub enum JobUpdate {
    Processing,
    Completed(Box<ExtractionOutcome>),
    Failed(JobFailure),
}

impl JobUpdate {
    pub fn completed(outcome: ExtractionOutcome) -> Self {
        Self::Completed(Box::new(outcome))
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Processing => JobStatus::Processing,
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("job {job_id}: invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}
