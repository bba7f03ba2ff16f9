//! # lumeo
//!
//! Low-light photo enhancement with a U-shaped convolutional network.
//!
//! An upload is validated defensively (size, magic-byte type, header
//! dimensions), decoded to a fixed-size tensor, run through the network, and
//! encoded back in its original format. A separate analysis path reports
//! mean brightness and whether the image counts as low-light.
//!
//! ## Example
//!
//! ```no_run
//! use lumeo::{Config, Enhancer};
//!
//! # fn main() -> lumeo::Result<()> {
//! let enhancer = Enhancer::new(Config::default())?;
//! enhancer.warm_up()?;
//!
//! let upload = std::fs::File::open("dark.jpg")?;
//! let enhanced = enhancer.enhance_reader(upload, Some("image/jpeg"))?;
//! std::fs::write("bright.jpg", &enhanced.bytes)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use self::error::{Error, ErrorClass, PublicError, Result};
pub use self::image::{BrightnessReport, MediaType};
pub use self::model::{ModelManager, ModelStatus};
pub use self::pipeline::{Config, Enhanced, Enhancer};
