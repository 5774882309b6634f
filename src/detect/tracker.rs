//! Movement tracking.
//!
//! Regions are tagged with a coarse anatomical zone taken from where their
//! bounding-box center falls in the frame. This is a position heuristic for a
//! supine patient filling the frame, not pose estimation: a hand raised over
//! the head is reported as "head".

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::regions::{extract_regions, BoundingBox, MovementRegion};
use super::segmentation::ForegroundMask;
use crate::PipelineError;

/// Top band (fraction of height) tagged as head.
pub const HEAD_BAND: f64 = 0.3;
/// Lower edge of the arm band.
pub const ARM_BAND: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Head,
    LeftArm,
    RightArm,
    LeftLeg,
    RightLeg,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Head => "head",
            Zone::LeftArm => "left_arm",
            Zone::RightArm => "right_arm",
            Zone::LeftLeg => "left_leg",
            Zone::RightLeg => "right_leg",
        }
    }

    /// Movement category stored alongside the zone.
    pub fn movement_type(&self) -> &'static str {
        match self {
            Zone::Head => "head_movement",
            Zone::LeftArm | Zone::RightArm => "arm_movement",
            Zone::LeftLeg | Zone::RightLeg => "leg_movement",
        }
    }

    /// Zone for a region centered at `(cx, cy)` in a `width` x `height` frame.
    pub fn classify(cx: f64, cy: f64, width: u32, height: u32) -> Zone {
        let (w, h) = (width as f64, height as f64);
        let left = cx < w * 0.5;
        if cy < h * HEAD_BAND {
            Zone::Head
        } else if cy < h * ARM_BAND {
            if left {
                Zone::LeftArm
            } else {
                Zone::RightArm
            }
        } else if left {
            Zone::LeftLeg
        } else {
            Zone::RightLeg
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerParams {
    /// Regions smaller than this (pixels) are noise.
    pub min_area: u32,
    /// Tracklets unseen for longer than this are destroyed.
    pub grace_s: f64,
    /// Cell size (pixels) used to quantize region centers into identity keys.
    pub position_quantum: u32,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            min_area: 500,
            grace_s: 2.0,
            position_quantum: 32,
        }
    }
}

impl TrackerParams {
    pub fn validate(&self) -> Result<()> {
        if self.min_area == 0 {
            return Err(anyhow!("tracker min_area must be >= 1"));
        }
        if !(self.grace_s > 0.0) || !self.grace_s.is_finite() {
            return Err(anyhow!("tracker grace_s must be > 0"));
        }
        if self.position_quantum == 0 {
            return Err(anyhow!("tracker position_quantum must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct TrackKey {
    zone: Zone,
    cell_x: u32,
    cell_y: u32,
}

#[derive(Clone, Debug)]
struct Tracklet {
    id: u64,
    zone: Zone,
    start_s: f64,
    last_seen_s: f64,
}

/// Snapshot emitted once per frame per matched tracklet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovementEvent {
    pub tracklet_id: u64,
    pub zone: Zone,
    pub duration_s: f64,
    /// Region area as a percentage of frame area, in [0, 100].
    pub intensity: f64,
    pub bbox: BoundingBox,
}

/// Tracklet table for one patient stream.
pub struct MovementTracker {
    params: TrackerParams,
    tracklets: HashMap<TrackKey, Tracklet>,
    next_id: u64,
    last_now: Option<f64>,
}

impl MovementTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            params,
            tracklets: HashMap::new(),
            next_id: 1,
            last_now: None,
        }
    }

    pub fn active_tracklets(&self) -> usize {
        self.tracklets.len()
    }

    /// Match mask regions to tracklets at time `now` and emit one event per
    /// matched tracklet, ordered by tracklet id.
    pub fn track(
        &mut self,
        mask: &ForegroundMask,
        frame_dims: (u32, u32),
        now: f64,
    ) -> Result<Vec<MovementEvent>> {
        if !now.is_finite() {
            return Err(PipelineError::DetectorStateCorruption(format!(
                "non-finite timestamp {}",
                now
            ))
            .into());
        }
        let (width, height) = frame_dims;
        if mask.width() != width || mask.height() != height {
            return Err(PipelineError::DetectorStateCorruption(format!(
                "mask is {}x{}, frame is {}x{}",
                mask.width(),
                mask.height(),
                width,
                height
            ))
            .into());
        }
        // Out-of-order timestamps are clamped, durations never run backwards.
        let now = match self.last_now {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last_now = Some(now);

        let grace = self.params.grace_s;
        self.tracklets
            .retain(|_, tracklet| now - tracklet.last_seen_s <= grace);

        let mut matched: HashMap<TrackKey, MovementRegion> = HashMap::new();
        for region in extract_regions(mask, self.params.min_area) {
            let (cx, cy) = region.bbox.center();
            let key = TrackKey {
                zone: Zone::classify(cx, cy, width, height),
                cell_x: cx as u32 / self.params.position_quantum,
                cell_y: cy as u32 / self.params.position_quantum,
            };
            match matched.get(&key) {
                Some(existing) if existing.area >= region.area => {}
                _ => {
                    matched.insert(key, region);
                }
            }
        }

        let frame_area = width as f64 * height as f64;
        let mut events = Vec::with_capacity(matched.len());
        for (key, region) in matched {
            let tracklet = self.tracklets.entry(key).or_insert_with(|| {
                let id = self.next_id;
                self.next_id += 1;
                Tracklet {
                    id,
                    zone: key.zone,
                    start_s: now,
                    last_seen_s: now,
                }
            });
            if tracklet.zone != key.zone {
                return Err(PipelineError::DetectorStateCorruption(format!(
                    "tracklet {} zone changed from {} to {}",
                    tracklet.id, tracklet.zone, key.zone
                ))
                .into());
            }
            tracklet.last_seen_s = now;
            let duration_s = now - tracklet.start_s;
            if duration_s < 0.0 {
                return Err(PipelineError::DetectorStateCorruption(format!(
                    "tracklet {} has negative duration",
                    tracklet.id
                ))
                .into());
            }
            let intensity = (region.area as f64 / frame_area * 100.0).clamp(0.0, 100.0);
            events.push(MovementEvent {
                tracklet_id: tracklet.id,
                zone: tracklet.zone,
                duration_s,
                intensity,
                bbox: region.bbox,
            });
        }
        events.sort_by_key(|event| event.tracklet_id);
        Ok(events)
    }
}
