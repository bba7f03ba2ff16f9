//! Model lifecycle: one owner of the loaded network per process.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::loader::NetworkLoader;
use super::unet::EnhancementNetwork;

enum State {
    Unloaded,
    /// A caller is reading the weights; others wait on the condvar.
    Loading,
    Loaded(Arc<EnhancementNetwork>),
    /// Load failed; stays here until [`ModelManager::reload`].
    Failed(String),
}

/// Observable lifecycle state, for health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Owns the enhancement network and loads it exactly once.
///
/// Construct one per process and share it behind an [`Arc`]. The state lock
/// is only held to inspect or change the state, never across the weight load
/// or inference, so [`Self::status`] answers immediately even mid-load.
pub struct ModelManager {
    loader: Box<dyn NetworkLoader>,
    state: Mutex<State>,
    settled: Condvar,
}

impl fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelManager")
            .field("weights", &self.loader.describe())
            .field("status", &self.status())
            .finish()
    }
}

impl ModelManager {
    pub fn new(loader: impl NetworkLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            state: Mutex::new(State::Unloaded),
            settled: Condvar::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> ModelStatus {
        match &*self.state.lock() {
            State::Unloaded => ModelStatus::Unloaded,
            State::Loading => ModelStatus::Loading,
            State::Loaded(_) => ModelStatus::Loaded,
            State::Failed(_) => ModelStatus::Failed,
        }
    }

    /// Load the weights if this has not happened yet.
    ///
    /// The first caller loads; concurrent callers wait for that load and
    /// share its result. A failed load is not retried until [`Self::reload`]
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelUnavailable`] if the load fails or has failed before.
    pub fn ensure_loaded(&self) -> Result<Arc<EnhancementNetwork>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                State::Loaded(network) => return Ok(Arc::clone(network)),
                State::Failed(reason) => {
                    return Err(Error::ModelUnavailable {
                        reason: reason.clone(),
                    })
                }
                State::Unloaded => break,
                State::Loading => {}
            }
            self.settled.wait(&mut state);
        }
        *state = State::Loading;
        drop(state);

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load()))
            .unwrap_or_else(|_| {
                Err(Error::ModelUnavailable {
                    reason: "weight loader panicked".to_string(),
                })
            });

        let mut state = self.state.lock();
        // A release or reload during the load leaves the state alone.
        let still_loading = matches!(*state, State::Loading);
        let result = match outcome {
            Ok(network) => {
                let network = Arc::new(network);
                tracing::info!(
                    weights = %self.loader.describe(),
                    elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Model loaded"
                );
                if still_loading {
                    *state = State::Loaded(Arc::clone(&network));
                }
                Ok(network)
            }
            Err(err) => {
                let reason = match err {
                    Error::ModelUnavailable { reason } => reason,
                    other => other.to_string(),
                };
                tracing::error!(weights = %self.loader.describe(), error = %reason, "Model load failed");
                if still_loading {
                    *state = State::Failed(reason.clone());
                }
                Err(Error::ModelUnavailable { reason })
            }
        };
        drop(state);
        self.settled.notify_all();

        result
    }

    /// Run one forward pass, loading the model first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelUnavailable`] if the model cannot be loaded, or
    /// the network's error if the forward pass fails.
    pub fn infer(&self, input: &ImageTensor) -> Result<ImageTensor> {
        let network = self.ensure_loaded()?;

        let start = Instant::now();
        let output = network.forward(input)?;
        tracing::debug!(
            shape = ?input.shape(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Inference complete"
        );

        Ok(output)
    }

    /// Drop the held weights. In-flight inferences keep their handle until they finish.
    pub fn release(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Unloaded);
        self.settled.notify_all();
        if matches!(previous, State::Loaded(_)) {
            tracing::info!("Model released");
        }
    }

    /// Forget any previous outcome and load again.
    ///
    /// A load already in progress is awaited instead of restarted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelUnavailable`] if the new load fails.
    pub fn reload(&self) -> Result<Arc<EnhancementNetwork>> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, State::Loading) {
                *state = State::Unloaded;
            }
        }
        self.ensure_loaded()
    }
}
