//! The enhancement and analysis paths over a shared model.

use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::error::Result;
use crate::image::{
    analyze_brightness, check_declared_type, check_size, decode_and_resize, read_limited,
    tensor_to_image, validate, BrightnessReport, MediaType, ValidatedImage,
};
use crate::model::{ModelManager, SafetensorsLoader};

use super::Config;

/// Output of the enhancement path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enhanced {
    /// Encoded output image.
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Output format; always the sniffed format of the upload.
    pub format: MediaType,
    pub original_width: u32,
    pub original_height: u32,
    pub input_brightness: BrightnessReport,
    pub output_brightness: BrightnessReport,
    /// Forward pass wall time, including a lazy model load.
    pub inference_ms: f64,
}

/// Validate, preprocess, infer, and postprocess uploads.
///
/// Cheap to share: every request borrows the same [`ModelManager`].
#[derive(Debug, Clone)]
pub struct Enhancer {
    config: Config,
    model: Arc<ModelManager>,
}

impl Enhancer {
    /// Create an enhancer that loads weights from the configured path.
    ///
    /// The model is loaded lazily; call [`Self::warm_up`] to load it now.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let path = config.resolved_weights_path();
        tracing::info!(weights = %path.display(), device = %config.device, "Initializing enhancer");

        let model = Arc::new(ModelManager::new(SafetensorsLoader::new(path)));
        Ok(Self { config, model })
    }

    /// Create an enhancer around an existing model manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_manager(config: Config, model: Arc<ModelManager>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, model })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn model(&self) -> &Arc<ModelManager> {
        &self.model
    }

    /// Read an upload in bounded chunks, stopping at the size limit.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PayloadTooLarge`] or [`crate::Error::UploadRead`].
    pub fn read_upload<R: Read>(&self, reader: R) -> Result<Vec<u8>> {
        read_limited(reader, self.config.max_file_size, self.config.chunk_size)
    }

    /// Run the size, type, and dimension checks.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self, bytes: &[u8]) -> Result<ValidatedImage> {
        validate(bytes, &self.config.limits())
    }

    /// Enhance an uploaded image.
    ///
    /// `declared` is the client's content type. It is only logged when it
    /// disagrees with the sniffed type; the sniffed type always wins.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`crate::Error::ModelUnavailable`], or
    /// [`crate::Error::InferenceFailure`]. No partial output is produced.
    pub fn enhance(&self, bytes: &[u8], declared: Option<&str>) -> Result<Enhanced> {
        let validated = self.validate(bytes)?;
        if let Some(declared) = declared {
            if MediaType::from_mime(declared) != Some(validated.media_type) {
                tracing::warn!(
                    declared,
                    sniffed = validated.media_type.mime(),
                    "Declared content type does not match upload"
                );
            }
        }

        let (input, _) =
            decode_and_resize(bytes, self.config.input_size, self.config.max_dimension)?;
        let input_brightness = analyze_brightness(&input, self.config.low_light_threshold);

        let start = Instant::now();
        let output = self.model.infer(&input)?;
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;
        drop(input);

        let output_brightness = analyze_brightness(&output, self.config.low_light_threshold);
        let encoded = tensor_to_image(&output, validated.media_type, self.config.output_quality)?;

        tracing::debug!(
            format = validated.media_type.name(),
            width = validated.width,
            height = validated.height,
            input_brightness = input_brightness.brightness,
            output_brightness = output_brightness.brightness,
            inference_ms,
            "Enhanced image"
        );

        Ok(Enhanced {
            bytes: encoded,
            format: validated.media_type,
            original_width: validated.width,
            original_height: validated.height,
            input_brightness,
            output_brightness,
            inference_ms,
        })
    }

    /// Read an upload in chunks and enhance it.
    ///
    /// # Errors
    ///
    /// See [`Self::read_upload`] and [`Self::enhance`].
    pub fn enhance_reader<R: Read>(&self, reader: R, declared: Option<&str>) -> Result<Enhanced> {
        let bytes = self.read_upload(reader)?;
        self.enhance(&bytes, declared)
    }

    /// Brightness of an uploaded image, without running the network.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnsupportedMediaType`] if `declared_type` is
    /// not allowed, and otherwise the size or decode failure.
    pub fn analyze(&self, bytes: &[u8], declared_type: &str) -> Result<BrightnessReport> {
        check_declared_type(declared_type)?;
        check_size(bytes, self.config.max_file_size)?;

        let (tensor, _) =
            decode_and_resize(bytes, self.config.input_size, self.config.max_dimension)?;
        Ok(analyze_brightness(&tensor, self.config.low_light_threshold))
    }

    /// Load the model now instead of on the first request.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ModelUnavailable`] if the load fails.
    pub fn warm_up(&self) -> Result<()> {
        self.model.ensure_loaded().map(|_| ())
    }

    /// Release the model's weights.
    pub fn shutdown(&self) {
        self.model.release();
    }
}
