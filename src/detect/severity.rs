use crate::{Acuity, SeverityTier};

pub const BASE_DURATION_THRESHOLD_S: f64 = 5.0;
pub const BASE_INTENSITY_THRESHOLD: f64 = 5.0;
pub const CRITICAL_DURATION_THRESHOLD_S: f64 = 2.0;
pub const CRITICAL_INTENSITY_THRESHOLD: f64 = 2.0;

/// Attention thresholds for an acuity level. Critical is twice these.
pub fn thresholds(acuity: Acuity) -> (f64, f64) {
    match acuity {
        Acuity::Critical => (CRITICAL_DURATION_THRESHOLD_S, CRITICAL_INTENSITY_THRESHOLD),
        Acuity::Stable | Acuity::Recovering => {
            (BASE_DURATION_THRESHOLD_S, BASE_INTENSITY_THRESHOLD)
        }
    }
}

/// Severity of one movement. Comparisons are strict: a value equal to a
/// threshold does not cross it.
pub fn classify(duration_s: f64, intensity: f64, acuity: Acuity) -> SeverityTier {
    let (duration_threshold, intensity_threshold) = thresholds(acuity);
    if intensity > 2.0 * intensity_threshold || duration_s > 2.0 * duration_threshold {
        SeverityTier::Critical
    } else if intensity > intensity_threshold || duration_s > duration_threshold {
        SeverityTier::Attention
    } else {
        SeverityTier::Normal
    }
}
