use anyhow::{anyhow, Result};
use zeroize::Zeroize;

use crate::frame::Frame;
use crate::PipelineError;

/// Tuning for the adaptive background model.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationParams {
    /// Exponential update weight per frame (1/history).
    pub learning_rate: f64,
    /// Squared-deviation threshold in units of the pixel's variance.
    pub variance_threshold: f64,
    pub initial_variance: f64,
    pub min_variance: f64,
    pub max_variance: f64,
    /// 3x3 dilation passes applied to the raw mask.
    pub dilation_iterations: u32,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            learning_rate: 1.0 / 120.0,
            variance_threshold: 16.0,
            initial_variance: 15.0,
            min_variance: 4.0,
            max_variance: 75.0,
            dilation_iterations: 2,
        }
    }
}

impl SegmentationParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(anyhow!(
                "segmentation learning_rate must be in (0, 1] (got {})",
                self.learning_rate
            ));
        }
        if !(self.variance_threshold > 0.0) {
            return Err(anyhow!("segmentation variance_threshold must be > 0"));
        }
        if !(self.min_variance > 0.0
            && self.min_variance <= self.initial_variance
            && self.initial_variance <= self.max_variance)
        {
            return Err(anyhow!(
                "segmentation variances must satisfy 0 < min <= initial <= max"
            ));
        }
        Ok(())
    }
}

// -------------------- Foreground mask --------------------

/// Binary mask, one byte per pixel (0 or 1). Zeroized on drop.
pub struct ForegroundMask {
    width: u32,
    height: u32,
    bits: Vec<u8>,
}

impl ForegroundMask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        self.bits[(y * self.width + x) as usize] != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub(crate) fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// Mask from a row-major bit vector.
    pub fn from_bits(width: u32, height: u32, bits: Vec<u8>) -> Result<Self> {
        if bits.len() != width as usize * height as usize {
            return Err(anyhow!(
                "mask has {} cells, expected {}x{}",
                bits.len(),
                width,
                height
            ));
        }
        Ok(Self {
            width,
            height,
            bits: bits.into_iter().map(|b| (b != 0) as u8).collect(),
        })
    }

    /// One 3x3 dilation pass, done as a horizontal then a vertical max.
    fn dilate_once(&mut self) {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut horiz = vec![0u8; self.bits.len()];
        for y in 0..h {
            let row = &self.bits[y * w..(y + 1) * w];
            for x in 0..w {
                let lo = x.saturating_sub(1);
                let hi = (x + 1).min(w - 1);
                horiz[y * w + x] = row[lo..=hi].iter().copied().max().unwrap_or(0);
            }
        }
        for y in 0..h {
            let lo = y.saturating_sub(1);
            let hi = (y + 1).min(h - 1);
            for x in 0..w {
                self.bits[y * w + x] = (lo..=hi).map(|yy| horiz[yy * w + x]).max().unwrap_or(0);
            }
        }
        horiz.zeroize();
    }
}

impl Drop for ForegroundMask {
    fn drop(&mut self) {
        self.bits.zeroize();
    }
}

// -------------------- Background model --------------------

struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
}

impl Drop for BackgroundModel {
    fn drop(&mut self) {
        self.mean.zeroize();
        self.variance.zeroize();
    }
}

/// Per-pixel running mean/variance background model for one camera stream.
///
/// The first frame seeds the model and yields an empty mask. Every later frame
/// is compared against the model and then folded into it, so slow illumination
/// drift is absorbed while fast motion stands out.
///
/// A pixel is foreground when `deviation^2 * sensitivity > threshold * variance`,
/// so a larger sensitivity never shrinks the mask.
pub struct SegmentationEngine {
    params: SegmentationParams,
    model: Option<BackgroundModel>,
}

impl SegmentationEngine {
    pub fn new(params: SegmentationParams) -> Self {
        Self {
            params,
            model: None,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.model.is_some()
    }

    pub fn segment(&mut self, frame: &Frame, sensitivity: f64) -> Result<ForegroundMask> {
        if !sensitivity.is_finite() || sensitivity <= 0.0 {
            return Err(anyhow!("sensitivity must be > 0 (got {})", sensitivity));
        }
        let (width, height) = (frame.width(), frame.height());

        let model = match self.model.as_mut() {
            None => {
                let mean: Vec<f32> = frame.luma().map(f32::from).collect();
                let variance = vec![self.params.initial_variance as f32; mean.len()];
                self.model = Some(BackgroundModel {
                    width,
                    height,
                    mean,
                    variance,
                });
                return Ok(ForegroundMask::empty(width, height));
            }
            Some(model) => model,
        };

        if model.width != width || model.height != height {
            return Err(PipelineError::DetectorStateCorruption(format!(
                "background model is {}x{}, frame is {}x{}",
                model.width, model.height, width, height
            ))
            .into());
        }

        let lr = self.params.learning_rate as f32;
        let threshold = self.params.variance_threshold as f32;
        let gain = sensitivity as f32;
        let (min_var, max_var) = (
            self.params.min_variance as f32,
            self.params.max_variance as f32,
        );

        let mut bits = vec![0u8; model.mean.len()];
        for (i, luma) in frame.luma().enumerate() {
            let mean = &mut model.mean[i];
            let var = &mut model.variance[i];
            let diff = f32::from(luma) - *mean;
            let dist2 = diff * diff;
            if dist2 * gain > threshold * *var {
                bits[i] = 1;
            }
            *mean += lr * diff;
            *var = (*var + lr * (dist2 - *var)).clamp(min_var, max_var);
        }

        let mut mask = ForegroundMask {
            width,
            height,
            bits,
        };
        for _ in 0..self.params.dilation_iterations {
            mask.dilate_once();
        }
        Ok(mask)
    }
}
