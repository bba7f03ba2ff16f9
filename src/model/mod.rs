//! The enhancement network, its weights, and its lifecycle.

pub mod init;
pub mod layers;
pub mod loader;
pub mod manager;
pub mod unet;
pub mod weights;

pub use init::{KaimingInit, ParamKind, ParameterSource, Recorder};
pub use loader::{
    default_weights_path, weight_candidates, Device, InitializedLoader, NetworkLoader,
    SafetensorsLoader, WEIGHTS_FILENAME,
};
pub use manager::{ModelManager, ModelStatus};
pub use unet::{EnhancementNetwork, NetworkConfig, DEPTH, SPATIAL_MULTIPLE};
pub use weights::{save_parameters, serialize_parameters, SafetensorsSource};
