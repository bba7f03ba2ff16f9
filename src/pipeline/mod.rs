//! Enhancement and analysis pipeline.

mod config;
mod enhancer;

pub use config::Config;
pub use enhancer::{Enhanced, Enhancer};
