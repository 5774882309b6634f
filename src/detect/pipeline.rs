use anyhow::Result;

use super::segmentation::{SegmentationEngine, SegmentationParams};
use super::tracker::{MovementEvent, MovementTracker, TrackerParams};
use crate::frame::{Frame, FrameGeometry};
use crate::PipelineError;

/// Segmentation and tracking state for one patient's stream.
pub struct MotionDetector {
    geometry: FrameGeometry,
    segmentation: SegmentationEngine,
    tracker: MovementTracker,
    frames: u64,
}

impl MotionDetector {
    pub fn new(
        geometry: FrameGeometry,
        segmentation: SegmentationParams,
        tracker: TrackerParams,
    ) -> Self {
        Self {
            geometry,
            segmentation: SegmentationEngine::new(segmentation),
            tracker: MovementTracker::new(tracker),
            frames: 0,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn active_tracklets(&self) -> usize {
        self.tracker.active_tracklets()
    }

    /// Run one frame through segmentation and tracking. The seeding frame
    /// returns no events.
    pub fn process(&mut self, frame: &Frame, sensitivity: f64) -> Result<Vec<MovementEvent>> {
        if frame.width() != self.geometry.width || frame.height() != self.geometry.height {
            return Err(PipelineError::DetectorStateCorruption(format!(
                "detector is {}x{}, frame is {}x{}",
                self.geometry.width,
                self.geometry.height,
                frame.width(),
                frame.height()
            ))
            .into());
        }
        let mask = self.segmentation.segment(frame, sensitivity)?;
        let events = self.tracker.track(
            &mask,
            (self.geometry.width, self.geometry.height),
            frame.timestamp_s(),
        )?;
        self.frames += 1;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    #[test]
    fn first_frame_never_reports_motion() {
        let geometry = FrameGeometry::new(32, 32, PixelFormat::Gray8).unwrap();
        let mut detector = MotionDetector::new(
            geometry,
            SegmentationParams::default(),
            TrackerParams {
                min_area: 1,
                ..TrackerParams::default()
            },
        );
        let noisy: Vec<u8> = (0..32 * 32).map(|i| (i * 37 % 251) as u8).collect();
        let frame = Frame::from_pixels(geometry, noisy, 0.0).unwrap();
        assert!(detector.process(&frame, 100.0).unwrap().is_empty());
        assert_eq!(detector.frames_processed(), 1);
    }
}
