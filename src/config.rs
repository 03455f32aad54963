use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::EncoderError, media::similarity::ColorDistance};

/// Encoder settings. Every field has a default, so a JSON file only needs
/// the fields it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Number of worker threads shared by the quantize and encode stages.
    pub pool_size: usize,
    /// Frames per stage submitted but not yet emitted.
    pub max_concurrency: usize,
    /// Palette size limit, 2 to 256.
    pub max_colors: u16,
    /// NeuQuant sampling factor, 1 (best) to 30 (fastest).
    pub quantizer_quality: i32,
    pub color_distance: ColorDistance,
    /// Normalised colour distance under which pixels count as unchanged.
    pub transparency_tolerance: f64,
    /// Enables merging of quantized frames with this tolerance.
    pub quantized_transparency_tolerance: Option<f64>,
    pub optimize_transparency: bool,
    /// RGB colour replacing transparent pixels, `0xRRGGBB`.
    pub alpha_fill: Option<u32>,
    pub crop_transparent: bool,
    pub minimum_frame_duration_ms: u64,
    /// 0 loops forever.
    pub loop_count: u16,
    pub comment: Option<String>,
    /// Upper bound on waiting for pipeline capacity.
    pub backpressure_timeout_ms: Option<u64>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get().min(8))
                .unwrap_or(2),
            max_concurrency: 8,
            max_colors: 256,
            quantizer_quality: 10,
            color_distance: ColorDistance::default(),
            transparency_tolerance: 0.01,
            quantized_transparency_tolerance: None,
            optimize_transparency: true,
            alpha_fill: None,
            crop_transparent: true,
            minimum_frame_duration_ms: 20,
            loop_count: 0,
            comment: None,
            backpressure_timeout_ms: None,
        }
    }
}

impl EncoderConfig {
    pub fn builder() -> EncoderConfigBuilder {
        EncoderConfigBuilder::default()
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: EncoderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), EncoderError> {
        let invalid = |msg: String| Err(EncoderError::InvalidConfig(msg));
        if self.pool_size == 0 {
            return invalid("pool_size must be at least 1".to_string());
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".to_string());
        }
        if !(2..=256).contains(&self.max_colors) {
            return invalid(format!("max_colors must be 2..=256, got {}", self.max_colors));
        }
        if !(1..=30).contains(&self.quantizer_quality) {
            return invalid(format!(
                "quantizer_quality must be 1..=30, got {}",
                self.quantizer_quality
            ));
        }
        if self.transparency_tolerance.is_nan() || self.transparency_tolerance < 0.0 {
            return invalid(format!(
                "transparency_tolerance must not be negative, got {}",
                self.transparency_tolerance
            ));
        }
        if let Some(tolerance) = self.quantized_transparency_tolerance {
            if tolerance.is_nan() || tolerance < 0.0 {
                return invalid(format!(
                    "quantized_transparency_tolerance must not be negative, got {}",
                    tolerance
                ));
            }
        }
        if let Some(fill) = self.alpha_fill {
            if fill > 0xFF_FFFF {
                return invalid(format!("alpha_fill {:#x} is not an RGB colour", fill));
            }
        }
        self.color_distance.validate().map_err(EncoderError::InvalidConfig)
    }

    pub fn minimum_frame_duration(&self) -> Duration {
        Duration::from_millis(self.minimum_frame_duration_ms)
    }

    pub fn backpressure_timeout(&self) -> Option<Duration> {
        self.backpressure_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Default)]
pub struct EncoderConfigBuilder {
    config: EncoderConfig,
}

impl EncoderConfigBuilder {
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn max_colors(mut self, max_colors: u16) -> Self {
        self.config.max_colors = max_colors;
        self
    }

    pub fn quantizer_quality(mut self, quality: i32) -> Self {
        self.config.quantizer_quality = quality;
        self
    }

    pub fn color_distance(mut self, distance: ColorDistance) -> Self {
        self.config.color_distance = distance;
        self
    }

    pub fn transparency_tolerance(mut self, tolerance: f64) -> Self {
        self.config.transparency_tolerance = tolerance;
        self
    }

    /// Enables merging of consecutive quantized frames.
    pub fn quantized_transparency_tolerance(mut self, tolerance: f64) -> Self {
        self.config.quantized_transparency_tolerance = Some(tolerance);
        self
    }

    pub fn optimize_transparency(mut self, enabled: bool) -> Self {
        self.config.optimize_transparency = enabled;
        self
    }

    pub fn alpha_fill(mut self, rgb: u32) -> Self {
        self.config.alpha_fill = Some(rgb);
        self
    }

    pub fn crop_transparent(mut self, enabled: bool) -> Self {
        self.config.crop_transparent = enabled;
        self
    }

    pub fn minimum_frame_duration(mut self, duration: Duration) -> Self {
        self.config.minimum_frame_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn loop_count(mut self, loop_count: u16) -> Self {
        self.config.loop_count = loop_count;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.config.comment = Some(comment.into());
        self
    }

    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn build(self) -> Result<EncoderConfig, EncoderError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
