use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::segmentation::ForegroundMask;

/// Axis-aligned box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// One connected foreground blob in one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MovementRegion {
    pub bbox: BoundingBox,
    /// Foreground pixel count.
    pub area: u32,
}

const NEIGHBORS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// 8-connected components of `mask` with at least `min_area` pixels,
/// in raster order of their first pixel.
pub fn extract_regions(mask: &ForegroundMask, min_area: u32) -> Vec<MovementRegion> {
    let w = mask.width() as i64;
    let h = mask.height() as i64;
    let bits = mask.bits();
    let mut visited = vec![false; bits.len()];
    let mut regions = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..bits.len() {
        if bits[start] == 0 || visited[start] {
            continue;
        }
        visited[start] = true;
        queue.push_back(start);

        let (mut min_x, mut min_y) = (i64::MAX, i64::MAX);
        let (mut max_x, mut max_y) = (i64::MIN, i64::MIN);
        let mut area = 0u32;

        while let Some(idx) = queue.pop_front() {
            let x = idx as i64 % w;
            let y = idx as i64 / w;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for (dx, dy) in NEIGHBORS {
                let nx = x + dx;
                let ny = y + dy;
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let n = (ny * w + nx) as usize;
                if bits[n] != 0 && !visited[n] {
                    visited[n] = true;
                    queue.push_back(n);
                }
            }
        }

        if area >= min_area {
            regions.push(MovementRegion {
                bbox: BoundingBox {
                    x: min_x as u32,
                    y: min_y as u32,
                    width: (max_x - min_x + 1) as u32,
                    height: (max_y - min_y + 1) as u32,
                },
                area,
            });
        }
    }
    regions
}
