//! Locating and loading network weights.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

use super::unet::{EnhancementNetwork, NetworkConfig};
use super::weights::SafetensorsSource;

/// Default weight filename.
pub const WEIGHTS_FILENAME: &str = "lumeo_unet.safetensors";

/// Compute device for inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    /// Run on the host CPU.
    #[default]
    Cpu,
}

impl Device {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            other => Err(Error::InvalidParameter {
                name: "device".to_string(),
                reason: format!("unsupported device {other:?}; this build runs on cpu only"),
            }),
        }
    }
}

/// Places the weight file is looked for, in order:
/// - `./models/lumeo_unet.safetensors`
/// - Linux: `~/.local/share/lumeo/models/lumeo_unet.safetensors`
/// - macOS: `~/Library/Application Support/lumeo/models/lumeo_unet.safetensors`
/// - Windows: `%APPDATA%\lumeo\models\lumeo_unet.safetensors`
#[must_use]
pub fn weight_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("models").join(WEIGHTS_FILENAME)];
    if let Some(base) = dirs::data_dir() {
        candidates.push(base.join("lumeo").join("models").join(WEIGHTS_FILENAME));
    }
    candidates
}

/// First existing candidate, or the first candidate when none exists yet.
#[must_use]
pub fn default_weights_path() -> PathBuf {
    let candidates = weight_candidates();
    candidates
        .iter()
        .find(|path| path.is_file())
        .or_else(|| candidates.first())
        .cloned()
        .unwrap_or_else(|| PathBuf::from(WEIGHTS_FILENAME))
}

/// Produces a ready network. The manager calls this at most once per load.
pub trait NetworkLoader: Send + Sync {
    /// Build the network from its weights.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelUnavailable`] if the weights cannot be read or parsed.
    fn load(&self) -> Result<EnhancementNetwork>;

    /// Human-readable origin of the weights, for logs.
    fn describe(&self) -> String;
}

/// Loads a network from a safetensors file on disk.
#[derive(Debug, Clone)]
pub struct SafetensorsLoader {
    path: PathBuf,
    config: NetworkConfig,
}

impl SafetensorsLoader {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: NetworkConfig::default(),
        }
    }

    /// Override the channel layout the file is expected to contain.
    #[must_use]
    pub const fn with_config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NetworkLoader for SafetensorsLoader {
    fn load(&self) -> Result<EnhancementNetwork> {
        let bytes = fs::read(&self.path).map_err(|err| Error::ModelUnavailable {
            reason: format!("cannot read weights {}: {err}", self.path.display()),
        })?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "Read weight file");

        let mut source = SafetensorsSource::new(&bytes)?;
        let network = EnhancementNetwork::build(self.config, &mut source)?;
        source.finish()?;
        Ok(network)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Builds a freshly initialized network instead of reading a file.
#[derive(Debug, Clone, Copy)]
pub struct InitializedLoader {
    pub config: NetworkConfig,
    pub seed: u64,
}

impl NetworkLoader for InitializedLoader {
    fn load(&self) -> Result<EnhancementNetwork> {
        EnhancementNetwork::initialized(self.config, Some(self.seed))
    }

    fn describe(&self) -> String {
        format!("initialized weights (seed {})", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;
    use crate::model::init::{KaimingInit, Recorder};
    use crate::model::manager::ModelManager;
    use crate::model::weights::save_parameters;

    const SMALL: NetworkConfig = NetworkConfig {
        in_channels: 3,
        out_channels: 3,
        base_channels: 2,
    };

    fn write_weights(path: &Path, config: NetworkConfig) {
        let mut recorder = Recorder::new(KaimingInit::seeded(11));
        EnhancementNetwork::build(config, &mut recorder).unwrap();
        save_parameters(path, &recorder.into_parameters()).unwrap();
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(" CPU ".parse::<Device>().unwrap(), Device::Cpu);
        assert!(matches!(
            "cuda".parse::<Device>(),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_candidates_start_with_local_models_dir() {
        let candidates = weight_candidates();
        assert_eq!(candidates[0], Path::new("models").join(WEIGHTS_FILENAME));
    }

    #[test]
    fn test_loads_exported_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WEIGHTS_FILENAME);
        write_weights(&path, SMALL);

        let network = SafetensorsLoader::new(&path)
            .with_config(SMALL)
            .load()
            .unwrap();

        assert_eq!(network.config(), &SMALL);
    }

    #[test]
    fn test_weight_file_inference_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WEIGHTS_FILENAME);
        write_weights(&path, SMALL);

        let manager = ModelManager::new(SafetensorsLoader::new(&path).with_config(SMALL));
        let input = Array4::from_shape_fn((1, 3, 32, 32), |(_, c, y, x)| {
            #[allow(clippy::cast_precision_loss)]
            let v = ((c * 5 + y * 3 + x) % 23) as f32 / 22.0;
            v
        });

        let first = manager.infer(&input).unwrap();
        let second = manager.infer(&input).unwrap();

        assert_eq!(first, second);
        assert!(first.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_missing_file_is_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SafetensorsLoader::new(dir.path().join("absent.safetensors"));

        assert!(matches!(
            loader.load(),
            Err(Error::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn test_wrong_architecture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WEIGHTS_FILENAME);
        write_weights(&path, SMALL);

        let wider = NetworkConfig {
            base_channels: 4,
            ..SMALL
        };
        let result = SafetensorsLoader::new(&path).with_config(wider).load();

        assert!(matches!(result, Err(Error::ModelUnavailable { .. })));
    }
}
