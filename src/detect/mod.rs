mod pipeline;
mod regions;
mod registry;
mod segmentation;
mod severity;
mod tracker;

pub use pipeline::MotionDetector;
pub use regions::{extract_regions, BoundingBox, MovementRegion};
pub use registry::{DetectorLease, DetectorRegistry, PatientSlot};
pub use segmentation::{ForegroundMask, SegmentationEngine, SegmentationParams};
pub use severity::{
    classify, thresholds, BASE_DURATION_THRESHOLD_S, BASE_INTENSITY_THRESHOLD,
    CRITICAL_DURATION_THRESHOLD_S, CRITICAL_INTENSITY_THRESHOLD,
};
pub use tracker::{MovementEvent, MovementTracker, TrackerParams, Zone};
