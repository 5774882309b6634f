//! Ward Motion Monitor
//!
//! Streaming movement detection and alerting for hospitalized patients.
//!
//! # Architecture
//!
//! Frames flow through a per-patient pipeline:
//!
//! 1. **Segmentation** (`detect::segmentation`): adaptive per-pixel background model,
//!    turns a frame into a dilated foreground mask.
//! 2. **Tracking** (`detect::tracker`): mask regions become tracklets with a zone tag,
//!    duration and intensity. Tracklets unseen for 2.0 s are dropped.
//! 3. **Severity** (`detect::severity`): pure (duration, intensity, acuity) -> tier.
//! 4. **Alerting** (`alerts`): qualifying events fan out to the assigned clinician and
//!    the nursing roster; critical events escalate to the alarm collaborator.
//! 5. **Sessions** (`session`, `api`): one streaming session per connection, with
//!    per-patient detector state shared and serialized through `detect::DetectorRegistry`.
//!
//! # Module Structure
//!
//! - `frame`: immutable frames, pixel formats, payload decoding
//! - `annotate`: bounding boxes and labels burned into outbound frames
//! - `storage`: persistence collaborator (`PatientStore`) with SQLite and in-memory impls
//! - `auth`: actor resolution for acknowledgement and staff subscriptions
//! - `transport`: wire framing and MQTT escalation
//! - Core types: identifiers, acuity, severity tiers, alert records, `PipelineError`

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod alerts;
pub mod annotate;
pub mod api;
pub mod auth;
pub mod config;
pub mod detect;
pub mod frame;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod transport;

pub use alerts::{
    AckOutcome, AlarmEscalator, AlertDispatcher, AlertNotification, AlertQueue, AlertRequest,
    AlertSink, ChannelRegistry, DenyReason, DispatchReport, LogAlarm, NotificationChannel,
};
pub use auth::{AuthResolver, TokenDirectory};
pub use detect::{
    classify, DetectorRegistry, ForegroundMask, MotionDetector, MovementEvent, MovementTracker,
    SegmentationEngine, SegmentationParams, TrackerParams, Zone,
};
pub use frame::{Frame, FrameDecoder, FrameEncoding, FrameGeometry, PixelFormat, RawDecoder};
pub use session::{FrameOutcome, FrameSummary, MovementSummary, Session, SessionDeps, SessionState};
pub use storage::{InMemoryPatientStore, PatientStore, SqlitePatientStore};
pub use telemetry::LogContext;

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- Identifiers --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovementId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub i64);

macro_rules! display_id {
    ($($ty:ident),*) => {
        $(
            impl std::fmt::Display for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_id!(PatientId, UserId, MovementId, AlertId);

// -------------------- Acuity / Severity --------------------

/// Clinical acuity of a patient's overall condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acuity {
    Critical,
    #[default]
    Stable,
    Recovering,
}

impl Acuity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acuity::Critical => "critical",
            Acuity::Stable => "stable",
            Acuity::Recovering => "recovering",
        }
    }
}

impl FromStr for Acuity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Acuity::Critical),
            "stable" => Ok(Acuity::Stable),
            "recovering" => Ok(Acuity::Recovering),
            other => Err(anyhow!("unknown acuity '{}'", other)),
        }
    }
}

/// Severity of a single movement event. Ordered `Normal < Attention < Critical`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SeverityTier {
    #[default]
    Normal,
    Attention,
    Critical,
}

impl SeverityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityTier::Normal => "normal",
            SeverityTier::Attention => "attention",
            SeverityTier::Critical => "critical",
        }
    }

    /// Tiers that create alerts.
    pub fn warrants_alert(&self) -> bool {
        *self >= SeverityTier::Attention
    }

    /// Capitalized form used in alert message text.
    pub fn title(&self) -> &'static str {
        match self {
            SeverityTier::Normal => "Normal",
            SeverityTier::Attention => "Attention",
            SeverityTier::Critical => "Critical",
        }
    }
}

impl FromStr for SeverityTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(SeverityTier::Normal),
            "attention" => Ok(SeverityTier::Attention),
            "critical" => Ok(SeverityTier::Critical),
            other => Err(anyhow!("unknown severity tier '{}'", other)),
        }
    }
}

// -------------------- Staff / Actors --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaffRole {
    Doctor,
    Nurse,
    Admin,
    Supervisor,
}

impl StaffRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaffRole::Doctor => "doctor",
            StaffRole::Nurse => "nurse",
            StaffRole::Admin => "admin",
            StaffRole::Supervisor => "supervisor",
        }
    }

    /// Roles allowed to acknowledge alerts addressed to someone else.
    pub fn is_supervisory(&self) -> bool {
        matches!(self, StaffRole::Admin | StaffRole::Supervisor)
    }
}

impl FromStr for StaffRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "doctor" => Ok(StaffRole::Doctor),
            "nurse" => Ok(StaffRole::Nurse),
            "admin" => Ok(StaffRole::Admin),
            "supervisor" => Ok(StaffRole::Supervisor),
            other => Err(anyhow!("unknown staff role '{}'", other)),
        }
    }
}

/// Authenticated identity performing an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: StaffRole,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub user_id: UserId,
    pub full_name: String,
    pub role: StaffRole,
}

// -------------------- Patient Context --------------------

pub const DEFAULT_SENSITIVITY: f64 = 1.0;

/// Read-only copy of the patient attributes the pipeline needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub patient_id: PatientId,
    pub acuity: Acuity,
    /// Movement sensitivity multiplier (> 0). Higher values report more foreground.
    pub sensitivity: f64,
    pub room: Option<String>,
    pub assigned_clinician: Option<UserId>,
}

impl PatientContext {
    pub fn new(patient_id: PatientId, acuity: Acuity) -> Self {
        Self {
            patient_id,
            acuity,
            sensitivity: DEFAULT_SENSITIVITY,
            room: None,
            assigned_clinician: None,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_room(mut self, room: &str) -> Self {
        self.room = Some(room.to_string());
        self
    }

    pub fn with_clinician(mut self, clinician: UserId) -> Self {
        self.assigned_clinician = Some(clinician);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.sensitivity.is_finite() || self.sensitivity <= 0.0 {
            return Err(anyhow!(
                "patient {} sensitivity must be > 0 (got {})",
                self.patient_id,
                self.sensitivity
            ));
        }
        Ok(())
    }
}

// -------------------- Records --------------------

/// Movement row handed to the persistence collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMovement {
    pub patient_id: PatientId,
    /// Coarse category, e.g. `arm_movement`.
    pub movement_type: String,
    pub zone: String,
    pub duration_s: f64,
    pub intensity: f64,
    pub severity: SeverityTier,
    pub recorded_at: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewAlert {
    pub patient_id: PatientId,
    pub recipient: UserId,
    pub movement_id: Option<MovementId>,
    pub message: String,
    pub severity: SeverityTier,
    pub created_at: u64,
}

/// Persisted alert. Created pending; acknowledged at most once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: AlertId,
    pub patient_id: PatientId,
    pub recipient: UserId,
    pub movement_id: Option<MovementId>,
    pub message: String,
    pub severity: SeverityTier,
    pub created_at: u64,
    pub acknowledged: bool,
    pub acknowledged_at: Option<u64>,
}

/// Per-patient movement counts by tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub normal: u64,
    pub attention: u64,
    pub critical: u64,
}

impl SeverityCounts {
    pub fn record(&mut self, tier: SeverityTier) {
        match tier {
            SeverityTier::Normal => self.normal += 1,
            SeverityTier::Attention => self.attention += 1,
            SeverityTier::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.normal + self.attention + self.critical
    }
}

// -------------------- Errors --------------------

/// Failure taxonomy for the pipeline. Every variant is scoped to one frame,
/// one session, or one delivery attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineError {
    FrameDecode(String),
    UnknownPatient(PatientId),
    InvalidGeometry(String),
    DetectorStateCorruption(String),
    Persistence(String),
    NotificationDelivery(String),
    UnauthorizedAcknowledgement { alert_id: AlertId, actor: UserId },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::FrameDecode(_) => "FRAME_DECODE_FAILURE",
            PipelineError::UnknownPatient(_) => "UNKNOWN_PATIENT",
            PipelineError::InvalidGeometry(_) => "INVALID_GEOMETRY",
            PipelineError::DetectorStateCorruption(_) => "DETECTOR_STATE_CORRUPTION",
            PipelineError::Persistence(_) => "PERSISTENCE_FAILURE",
            PipelineError::NotificationDelivery(_) => "NOTIFICATION_DELIVERY_FAILURE",
            PipelineError::UnauthorizedAcknowledgement { .. } => "UNAUTHORIZED_ACKNOWLEDGEMENT",
        }
    }

    /// Find a pipeline error anywhere in an `anyhow` chain.
    pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
        err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
    }

    /// Errors that end the session rather than the frame.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::DetectorStateCorruption(_)
                | PipelineError::UnknownPatient(_)
                | PipelineError::InvalidGeometry(_)
        )
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::FrameDecode(msg) => write!(f, "{}: {}", self.code(), msg),
            PipelineError::UnknownPatient(id) => {
                write!(f, "{}: patient {} not found", self.code(), id)
            }
            PipelineError::InvalidGeometry(msg) => write!(f, "{}: {}", self.code(), msg),
            PipelineError::DetectorStateCorruption(msg) => write!(f, "{}: {}", self.code(), msg),
            PipelineError::Persistence(msg) => write!(f, "{}: {}", self.code(), msg),
            PipelineError::NotificationDelivery(msg) => write!(f, "{}: {}", self.code(), msg),
            PipelineError::UnauthorizedAcknowledgement { alert_id, actor } => write!(
                f,
                "{}: user {} may not acknowledge alert {}",
                self.code(),
                actor,
                alert_id
            ),
        }
    }
}

impl std::error::Error for PipelineError {}
