//! One streaming session per connection.
//!
//! `Init -> Connected -> Streaming -> {Disconnected, Error} -> Closed`
//!
//! A session holds a lease on its patient's shared detector. Frames are
//! processed under that patient's lock; persistence and alert hand-off happen
//! after the lock is released.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::alerts::{movement_message, AlertRequest, AlertSink};
use crate::annotate;
use crate::detect::{classify, DetectorLease, DetectorRegistry, MovementEvent, Zone};
use crate::frame::{decoder_for, FrameDecoder, FrameEncoding, FrameGeometry};
use crate::storage::PatientStore;
use crate::telemetry::LogContext;
use crate::{now_s, NewMovement, PatientContext, PatientId, PipelineError, SeverityTier};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connected,
    Streaming,
    Disconnected,
    Error,
    Closed,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn PatientStore>,
    pub registry: Arc<DetectorRegistry>,
    pub alerts: Arc<dyn AlertSink>,
    pub log: LogContext,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MovementSummary {
    pub zone: Zone,
    pub duration: f64,
    pub intensity: f64,
    pub severity: SeverityTier,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FrameSummary {
    pub motion_detected: bool,
    pub movements: Vec<MovementSummary>,
}

/// Result of one processed frame.
pub struct FrameOutcome {
    /// Same geometry and pixel format as the inbound frame.
    pub annotated: Vec<u8>,
    pub summary: FrameSummary,
    pub events: Vec<MovementEvent>,
    pub persisted: usize,
    pub alerts_submitted: usize,
}

pub struct Session {
    id: u64,
    state: SessionState,
    patient: PatientContext,
    geometry: FrameGeometry,
    decoder: Box<dyn FrameDecoder>,
    lease: Option<DetectorLease>,
    deps: SessionDeps,
    log: LogContext,
    frames: u64,
}

impl Session {
    /// Verify the patient and join its detector. Any failure here means no
    /// session was established.
    pub fn open(
        id: u64,
        patient_id: PatientId,
        geometry: FrameGeometry,
        encoding: FrameEncoding,
        deps: SessionDeps,
    ) -> Result<Self> {
        let log = deps
            .log
            .scoped("session", id)
            .scoped("patient", patient_id);
        let patient = deps
            .store
            .fetch_patient(patient_id)?
            .ok_or(PipelineError::UnknownPatient(patient_id))?;
        patient.validate()?;
        let decoder = decoder_for(encoding)?;
        let lease = deps.registry.acquire(patient_id, geometry)?;
        log.info(format_args!(
            "connected {}x{} {} acuity={}",
            geometry.width,
            geometry.height,
            geometry.format.as_str(),
            patient.acuity.as_str()
        ));
        Ok(Self {
            id,
            state: SessionState::Connected,
            patient,
            geometry,
            decoder,
            lease: Some(lease),
            deps,
            log,
            frames: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn patient(&self) -> &PatientContext {
        &self.patient
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Seconds on the patient's shared clock.
    pub fn clock_s(&self) -> Result<f64> {
        self.lease
            .as_ref()
            .map(DetectorLease::elapsed_s)
            .ok_or_else(|| anyhow!("session {} has no detector", self.id))
    }

    /// Process one frame using the patient's clock for its timestamp.
    pub fn handle_frame_now(&mut self, payload: &[u8]) -> Result<FrameOutcome> {
        let now = self.clock_s()?;
        self.handle_frame(payload, now)
    }

    /// Process one frame captured at `now` seconds.
    ///
    /// A decode failure affects only this frame. Any other processing fault
    /// moves the session to `Error` and discards the patient's detector.
    pub fn handle_frame(&mut self, payload: &[u8], now: f64) -> Result<FrameOutcome> {
        match self.state {
            SessionState::Connected => self.state = SessionState::Streaming,
            SessionState::Streaming => {}
            other => return Err(anyhow!("session {} cannot accept frames in {:?}", self.id, other)),
        }
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| anyhow!("session {} has no detector", self.id))?;

        let frame = match self.decoder.decode(payload, &self.geometry, now) {
            Ok(frame) => frame,
            Err(err) => {
                self.log.warn(format_args!("frame dropped: {}", err));
                return Err(err);
            }
        };

        let events = match lease.process(&frame, self.patient.sensitivity) {
            Ok(events) => events,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        self.frames += 1;

        let annotated = annotate::render(&frame, &events);
        drop(frame);

        let recorded_at = now_s()?;
        let mut summary = FrameSummary {
            motion_detected: !events.is_empty(),
            movements: Vec::with_capacity(events.len()),
        };
        let mut persisted = 0;
        let mut alerts_submitted = 0;
        for event in &events {
            let severity = classify(event.duration_s, event.intensity, self.patient.acuity);
            summary.movements.push(MovementSummary {
                zone: event.zone,
                duration: event.duration_s,
                intensity: event.intensity,
                severity,
            });

            let movement = NewMovement {
                patient_id: self.patient.patient_id,
                movement_type: event.zone.movement_type().to_string(),
                zone: event.zone.as_str().to_string(),
                duration_s: event.duration_s,
                intensity: event.intensity,
                severity,
                recorded_at,
            };
            let movement_id = match self.deps.store.create_movement(&movement) {
                Ok(id) => {
                    persisted += 1;
                    Some(id)
                }
                Err(err) => {
                    self.log.error(format_args!("movement not stored: {}", err));
                    None
                }
            };

            if severity.warrants_alert() {
                let request = AlertRequest {
                    patient: self.patient.clone(),
                    movement_id,
                    severity,
                    message: movement_message(
                        severity,
                        event.zone,
                        event.duration_s,
                        event.intensity,
                    ),
                    created_at: recorded_at,
                };
                match self.deps.alerts.submit(request) {
                    Ok(()) => alerts_submitted += 1,
                    Err(err) => self.log.error(format_args!("alert not submitted: {}", err)),
                }
            }
        }

        Ok(FrameOutcome {
            annotated,
            summary,
            events,
            persisted,
            alerts_submitted,
        })
    }

    /// Client-initiated close.
    pub fn disconnect(&mut self) {
        if matches!(self.state, SessionState::Connected | SessionState::Streaming) {
            self.state = SessionState::Disconnected;
            self.log
                .info(format_args!("disconnected after {} frames", self.frames));
        }
        self.close();
    }

    /// Unrecoverable fault: discard the patient's detector and close.
    pub fn fail(&mut self, err: &anyhow::Error) {
        let code = PipelineError::classify(err).map_or("PROCESSING_FAULT", PipelineError::code);
        self.log.error(format_args!("session failed [{}]: {}", code, err));
        self.state = SessionState::Error;
        if let Some(lease) = self.lease.as_ref() {
            if let Err(discard_err) = lease.discard() {
                self.log.error(format_args!("{}", discard_err));
            }
        }
        self.close();
    }

    fn close(&mut self) {
        self.lease = None;
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.disconnect();
        }
    }
}
