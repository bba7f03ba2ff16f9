//! Safetensors weight files.
//!
//! Tensor names follow the PyTorch state dict of the reference network
//! (e.g. `enc1.conv.conv.0.weight`), stored as little-endian F32.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::error::{Error, Result};

use super::init::{ParamKind, ParameterSource};

/// Buffers PyTorch keeps in batch-norm layers that inference never reads.
const IGNORED_SUFFIX: &str = ".num_batches_tracked";

/// Reads parameters out of an in-memory safetensors file.
///
/// Loading is strict: after the network is built, [`SafetensorsSource::finish`]
/// rejects any tensor that was not consumed.
pub struct SafetensorsSource<'data> {
    tensors: SafeTensors<'data>,
    consumed: HashSet<String>,
}

impl<'data> SafetensorsSource<'data> {
    /// Parse the safetensors header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelUnavailable`] if the header is malformed.
    pub fn new(bytes: &'data [u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes).map_err(|err| Error::ModelUnavailable {
            reason: format!("malformed safetensors file: {err}"),
        })?;
        Ok(Self {
            tensors,
            consumed: HashSet::new(),
        })
    }

    /// Check that every stored tensor was used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelUnavailable`] listing unexpected tensor names.
    pub fn finish(self) -> Result<()> {
        let mut unexpected: Vec<&str> = self
            .tensors
            .names()
            .into_iter()
            .map(String::as_str)
            .filter(|name| !name.ends_with(IGNORED_SUFFIX) && !self.consumed.contains(*name))
            .collect();

        if unexpected.is_empty() {
            return Ok(());
        }
        unexpected.sort_unstable();
        Err(Error::ModelUnavailable {
            reason: format!("unexpected tensors in weight file: {}", unexpected.join(", ")),
        })
    }
}

impl ParameterSource for SafetensorsSource<'_> {
    fn fetch(&mut self, name: &str, _kind: ParamKind, shape: &[usize]) -> Result<ArrayD<f32>> {
        let view = self
            .tensors
            .tensor(name)
            .map_err(|_| Error::ModelUnavailable {
                reason: format!("missing tensor {name}"),
            })?;

        if view.dtype() != Dtype::F32 {
            return Err(Error::ModelUnavailable {
                reason: format!("tensor {name} has dtype {:?}, expected F32", view.dtype()),
            });
        }
        if view.shape() != shape {
            return Err(Error::ModelUnavailable {
                reason: format!(
                    "tensor {name} has shape {:?}, expected {shape:?}",
                    view.shape()
                ),
            });
        }

        let values: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let tensor =
            ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|err| Error::ModelUnavailable {
                reason: format!("tensor {name}: {err}"),
            })?;

        self.consumed.insert(name.to_string());
        Ok(tensor)
    }
}

/// Serialize named tensors to safetensors bytes.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if a tensor cannot be serialized.
pub fn serialize_parameters(parameters: &[(String, ArrayD<f32>)]) -> Result<Vec<u8>> {
    let buffers: Vec<(&str, Vec<usize>, Vec<u8>)> = parameters
        .iter()
        .map(|(name, tensor)| {
            let bytes = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.as_str(), tensor.shape().to_vec(), bytes)
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|err| Error::InvalidParameter {
                    name: (*name).to_string(),
                    reason: err.to_string(),
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    safetensors::serialize(views, &metadata).map_err(|err| Error::InvalidParameter {
        name: "weights".to_string(),
        reason: err.to_string(),
    })
}

/// Write named tensors to a safetensors file.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn save_parameters(path: &Path, parameters: &[(String, ArrayD<f32>)]) -> Result<()> {
    let bytes = serialize_parameters(parameters)?;

    // Write to a temporary file first, then rename for atomicity
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    fn sample_parameters() -> Vec<(String, ArrayD<f32>)> {
        vec![
            (
                "layer.weight".to_string(),
                Array::from_shape_fn(IxDyn(&[2, 3]), |idx| {
                    #[allow(clippy::cast_precision_loss)]
                    let v = (idx[0] * 3 + idx[1]) as f32;
                    v
                }),
            ),
            ("layer.bias".to_string(), ArrayD::from_elem(IxDyn(&[2]), -0.5)),
        ]
    }

    #[test]
    fn test_serialized_tensors_read_back() {
        let bytes = serialize_parameters(&sample_parameters()).unwrap();
        let mut source = SafetensorsSource::new(&bytes).unwrap();

        let weight = source
            .fetch("layer.weight", ParamKind::ConvWeight, &[2, 3])
            .unwrap();
        let bias = source
            .fetch("layer.bias", ParamKind::ConvBias { fan_in: 3 }, &[2])
            .unwrap();

        assert_eq!(weight[[1, 2]], 5.0);
        assert_eq!(bias[[0]], -0.5);
        source.finish().unwrap();
    }

    #[test]
    fn test_missing_tensor() {
        let bytes = serialize_parameters(&sample_parameters()).unwrap();
        let mut source = SafetensorsSource::new(&bytes).unwrap();

        assert!(matches!(
            source.fetch("other.weight", ParamKind::ConvWeight, &[2, 3]),
            Err(Error::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let bytes = serialize_parameters(&sample_parameters()).unwrap();
        let mut source = SafetensorsSource::new(&bytes).unwrap();

        assert!(matches!(
            source.fetch("layer.weight", ParamKind::ConvWeight, &[3, 2]),
            Err(Error::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn test_unconsumed_tensor_is_rejected() {
        let bytes = serialize_parameters(&sample_parameters()).unwrap();
        let mut source = SafetensorsSource::new(&bytes).unwrap();
        source
            .fetch("layer.weight", ParamKind::ConvWeight, &[2, 3])
            .unwrap();

        match source.finish() {
            Err(Error::ModelUnavailable { reason }) => assert!(reason.contains("layer.bias")),
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_counter_is_ignored() {
        let mut parameters = sample_parameters();
        parameters.push((
            "norm.num_batches_tracked".to_string(),
            ArrayD::zeros(IxDyn(&[])),
        ));
        let bytes = serialize_parameters(&parameters).unwrap();
        let mut source = SafetensorsSource::new(&bytes).unwrap();
        source
            .fetch("layer.weight", ParamKind::ConvWeight, &[2, 3])
            .unwrap();
        source.fetch("layer.bias", ParamKind::NormBias, &[2]).unwrap();

        source.finish().unwrap();
    }

    #[test]
    fn test_garbage_is_model_unavailable() {
        assert!(matches!(
            SafetensorsSource::new(b"not a weight file"),
            Err(Error::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn test_save_parameters_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        save_parameters(&path, &sample_parameters()).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert!(SafetensorsSource::new(&bytes).is_ok());
        assert!(!path.with_extension("tmp").exists());
    }
}
