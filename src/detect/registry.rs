use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};

use super::pipeline::MotionDetector;
use super::segmentation::SegmentationParams;
use super::tracker::{MovementEvent, TrackerParams};
use crate::frame::{Frame, FrameGeometry};
use crate::telemetry::LogContext;
use crate::{PatientId, PipelineError};

/// Shared detector state for one patient.
///
/// The detector sits behind its own `Mutex`, so at most one frame per patient
/// is mid-processing while other patients proceed in parallel.
pub struct PatientSlot {
    patient_id: PatientId,
    geometry: FrameGeometry,
    epoch: Instant,
    detector: Mutex<Option<MotionDetector>>,
}

impl PatientSlot {
    pub fn patient_id(&self) -> PatientId {
        self.patient_id
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }
}

struct RegistryEntry {
    slot: Arc<PatientSlot>,
    viewers: usize,
}

/// Lifecycle-managed map from patient to detector state.
///
/// Entries are reference counted by `DetectorLease`: the first lease for a
/// patient creates the entry, the last one dropped removes it.
pub struct DetectorRegistry {
    entries: Mutex<HashMap<PatientId, RegistryEntry>>,
    segmentation: SegmentationParams,
    tracker: TrackerParams,
    log: LogContext,
}

impl DetectorRegistry {
    pub fn new(
        segmentation: SegmentationParams,
        tracker: TrackerParams,
        log: LogContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            segmentation,
            tracker,
            log,
        })
    }

    /// Join (or start) the shared detector for `patient_id`.
    ///
    /// Every viewer of a patient must agree on frame geometry.
    pub fn acquire(
        self: &Arc<Self>,
        patient_id: PatientId,
        geometry: FrameGeometry,
    ) -> Result<DetectorLease> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("detector registry lock poisoned"))?;
        let entry = entries.entry(patient_id).or_insert_with(|| RegistryEntry {
            slot: Arc::new(PatientSlot {
                patient_id,
                geometry,
                epoch: Instant::now(),
                detector: Mutex::new(None),
            }),
            viewers: 0,
        });
        let active = entry.slot.geometry;
        if active.width != geometry.width
            || active.height != geometry.height
            || active.format != geometry.format
        {
            if entry.viewers == 0 {
                entries.remove(&patient_id);
            }
            return Err(PipelineError::InvalidGeometry(format!(
                "patient {} is already streaming at {}x{} {}",
                patient_id,
                active.width,
                active.height,
                active.format.as_str()
            ))
            .into());
        }
        entry.viewers += 1;
        self.log.debug(format_args!(
            "patient {} viewers={}",
            patient_id, entry.viewers
        ));
        Ok(DetectorLease {
            registry: Arc::clone(self),
            slot: Arc::clone(&entry.slot),
        })
    }

    pub fn viewer_count(&self, patient_id: PatientId) -> Result<usize> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("detector registry lock poisoned"))?;
        Ok(entries.get(&patient_id).map_or(0, |e| e.viewers))
    }

    pub fn active_patients(&self) -> Result<Vec<PatientId>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("detector registry lock poisoned"))?;
        let mut ids: Vec<PatientId> = entries.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn release(&self, slot: &Arc<PatientSlot>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let patient_id = slot.patient_id;
        let remove = match entries.get_mut(&patient_id) {
            Some(entry) if Arc::ptr_eq(&entry.slot, slot) => {
                entry.viewers = entry.viewers.saturating_sub(1);
                entry.viewers == 0
            }
            _ => false,
        };
        if remove {
            entries.remove(&patient_id);
            self.log.debug(format_args!(
                "patient {} detector state released",
                patient_id
            ));
        }
    }
}

/// One viewer's hold on a patient's detector. Dropping it releases the hold.
pub struct DetectorLease {
    registry: Arc<DetectorRegistry>,
    slot: Arc<PatientSlot>,
}

impl DetectorLease {
    pub fn patient_id(&self) -> PatientId {
        self.slot.patient_id
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.slot.geometry
    }

    /// Seconds on the patient's clock, which starts when the entry is created.
    pub fn elapsed_s(&self) -> f64 {
        self.slot.epoch.elapsed().as_secs_f64()
    }

    /// Process a frame against the patient's shared detector, seeding a fresh
    /// one when none exists. A corruption error discards the state.
    pub fn process(&self, frame: &Frame, sensitivity: f64) -> Result<Vec<MovementEvent>> {
        let mut guard = self
            .slot
            .detector
            .lock()
            .map_err(|_| anyhow!("patient {} detector lock poisoned", self.slot.patient_id))?;
        let detector = guard.get_or_insert_with(|| {
            MotionDetector::new(
                self.slot.geometry,
                self.registry.segmentation.clone(),
                self.registry.tracker.clone(),
            )
        });
        match detector.process(frame, sensitivity) {
            Ok(events) => Ok(events),
            Err(err) => {
                if matches!(
                    PipelineError::classify(&err),
                    Some(PipelineError::DetectorStateCorruption(_))
                ) {
                    *guard = None;
                }
                Err(err)
            }
        }
    }

    /// Drop the patient's detector state; the next frame re-seeds.
    pub fn discard(&self) -> Result<()> {
        let mut guard = self
            .slot
            .detector
            .lock()
            .map_err(|_| anyhow!("patient {} detector lock poisoned", self.slot.patient_id))?;
        *guard = None;
        Ok(())
    }

    pub fn is_seeded(&self) -> Result<bool> {
        let guard = self
            .slot
            .detector
            .lock()
            .map_err(|_| anyhow!("patient {} detector lock poisoned", self.slot.patient_id))?;
        Ok(guard.is_some())
    }
}

impl Drop for DetectorLease {
    fn drop(&mut self) {
        self.registry.release(&self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn registry() -> Arc<DetectorRegistry> {
        DetectorRegistry::new(
            SegmentationParams::default(),
            TrackerParams::default(),
            LogContext::new("test"),
        )
    }

    fn geometry(w: u32, h: u32) -> FrameGeometry {
        FrameGeometry::new(w, h, PixelFormat::Gray8).unwrap()
    }

    #[test]
    fn state_survives_until_last_viewer_leaves() {
        let registry = registry();
        let g = geometry(8, 8);
        let a = registry.acquire(PatientId(1), g).unwrap();
        let b = registry.acquire(PatientId(1), g).unwrap();
        assert_eq!(registry.viewer_count(PatientId(1)).unwrap(), 2);

        let frame = Frame::from_pixels(g, vec![0; 64], 0.0).unwrap();
        a.process(&frame, 1.0).unwrap();
        drop(a);
        assert!(b.is_seeded().unwrap());
        drop(b);
        assert_eq!(registry.viewer_count(PatientId(1)).unwrap(), 0);
        assert!(registry.active_patients().unwrap().is_empty());

        let c = registry.acquire(PatientId(1), g).unwrap();
        assert!(!c.is_seeded().unwrap());
    }

    #[test]
    fn conflicting_geometry_is_rejected() {
        let registry = registry();
        let _a = registry.acquire(PatientId(1), geometry(8, 8)).unwrap();
        let err = registry.acquire(PatientId(1), geometry(16, 8)).err().expect("expected error");
        assert_eq!(
            PipelineError::classify(&err).map(|e| e.code()),
            Some("INVALID_GEOMETRY")
        );
        assert_eq!(registry.viewer_count(PatientId(1)).unwrap(), 1);
        assert!(registry.acquire(PatientId(2), geometry(16, 8)).is_ok());
    }

    #[test]
    fn discard_forces_reseed() {
        let registry = registry();
        let g = geometry(4, 4);
        let lease = registry.acquire(PatientId(3), g).unwrap();
        let frame = Frame::from_pixels(g, vec![9; 16], 0.0).unwrap();
        lease.process(&frame, 1.0).unwrap();
        assert!(lease.is_seeded().unwrap());
        lease.discard().unwrap();
        assert!(!lease.is_seeded().unwrap());
    }
}
