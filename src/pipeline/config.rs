//! Pipeline configuration and its range checks.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::image::{
    ValidationLimits, DEFAULT_CHUNK_SIZE, DEFAULT_INPUT_SIZE, DEFAULT_MAX_DIMENSION,
    DEFAULT_MAX_FILE_SIZE, LOW_LIGHT_THRESHOLD,
};
use crate::model::{default_weights_path, Device, SPATIAL_MULTIPLE};

/// Configuration for the enhancement pipeline.
///
/// Read once at startup and passed in as plain values.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum upload size in bytes.
    pub max_file_size: usize,

    /// Maximum accepted width or height in pixels.
    pub max_dimension: u32,

    /// Square resolution the network runs at. Must be a multiple of 16.
    pub input_size: u32,

    /// Mean brightness below which an image counts as low-light.
    pub low_light_threshold: f64,

    /// Output JPEG quality (1-100).
    pub output_quality: u8,

    /// Chunk size for incremental upload reads.
    pub chunk_size: usize,

    /// Weight file. None searches the default locations.
    pub weights_path: Option<PathBuf>,

    /// Compute device.
    pub device: Device,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_dimension: DEFAULT_MAX_DIMENSION,
            input_size: DEFAULT_INPUT_SIZE,
            low_light_threshold: LOW_LIGHT_THRESHOLD,
            output_quality: 75,
            chunk_size: DEFAULT_CHUNK_SIZE,
            weights_path: None,
            device: Device::Cpu,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(invalid("max_file_size", "must be greater than 0"));
        }

        if self.max_dimension == 0 {
            return Err(invalid("max_dimension", "must be greater than 0"));
        }

        let multiple = u32::try_from(SPATIAL_MULTIPLE).unwrap_or(u32::MAX);
        if self.input_size == 0 || self.input_size % multiple != 0 {
            return Err(invalid(
                "input_size",
                &format!("must be a positive multiple of {multiple}"),
            ));
        }

        if !(0.0..=1.0).contains(&self.low_light_threshold) {
            return Err(invalid("low_light_threshold", "must be between 0.0 and 1.0"));
        }

        if !(1..=100).contains(&self.output_quality) {
            return Err(invalid("output_quality", "must be between 1 and 100"));
        }

        if self.chunk_size == 0 || self.chunk_size > self.max_file_size {
            return Err(invalid(
                "chunk_size",
                "must be greater than 0 and at most max_file_size",
            ));
        }

        Ok(())
    }

    /// Limits applied to every upload.
    #[must_use]
    pub const fn limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_file_size: self.max_file_size,
            max_dimension: self.max_dimension,
        }
    }

    /// The configured weight file, or the default location.
    #[must_use]
    pub fn resolved_weights_path(&self) -> PathBuf {
        self.weights_path.clone().unwrap_or_else(default_weights_path)
    }
}

fn invalid(name: &str, reason: &str) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
