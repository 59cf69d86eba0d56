//! Regression models consumed as pure functions over fixed-size feature vectors.

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ModelError;

/// A fixed-shape numeric function.
pub trait Regressor: Send + Sync {
    fn input_len(&self) -> usize;
    fn output_len(&self) -> usize;
    fn predict(&self, features: &[f64]) -> Vec<f64>;
}

/// Check a model against the shape a caller is about to feed it.
pub fn check_shape(
    model: &dyn Regressor,
    inputs: usize,
    min_outputs: usize,
) -> Result<(), ModelError> {
    if model.input_len() != inputs {
        return Err(ModelError::InputDimension {
            expected: model.input_len(),
            got: inputs,
        });
    }
    if model.output_len() < min_outputs {
        return Err(ModelError::OutputDimension {
            expected: min_outputs,
            got: model.output_len(),
        });
    }
    Ok(())
}

/// Always returns the same outputs. Used when no trained model is deployed.
#[derive(Clone, Debug)]
pub struct ConstantRegressor {
    inputs: usize,
    outputs: Vec<f64>,
}

impl ConstantRegressor {
    pub fn new(inputs: usize, outputs: Vec<f64>) -> Self {
        Self { inputs, outputs }
    }
}

impl Regressor for ConstantRegressor {
    fn input_len(&self) -> usize {
        self.inputs
    }

    fn output_len(&self) -> usize {
        self.outputs.len()
    }

    fn predict(&self, _features: &[f64]) -> Vec<f64> {
        self.outputs.clone()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Identity,
}

/// One fully connected layer; `weights[o][i]` maps input `i` to output `o`.
#[derive(Clone, Debug, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    #[serde(default = "default_activation")]
    pub activation: Activation,
}

fn default_activation() -> Activation {
    Activation::Identity
}

/// Small feed-forward network loaded from exported JSON weights.
#[derive(Clone, Debug, Deserialize)]
pub struct DenseNet {
    layers: Vec<DenseLayer>,
}

impl DenseNet {
    pub fn new(layers: Vec<DenseLayer>) -> Result<Self, ModelError> {
        let net = Self { layers };
        net.validate()?;
        Ok(net)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let net: DenseNet = serde_json::from_str(raw)?;
        net.validate()?;
        Ok(net)
    }

    pub fn from_path(path: &Path) -> Result<Self, ModelError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.layers.is_empty() {
            return Err(ModelError::Layer {
                layer: 0,
                reason: "network has no layers".into(),
            });
        }
        let mut width: Option<usize> = None;
        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.weights.is_empty() {
                return Err(ModelError::Layer {
                    layer: idx,
                    reason: "no output rows".into(),
                });
            }
            if layer.bias.len() != layer.weights.len() {
                return Err(ModelError::Layer {
                    layer: idx,
                    reason: format!("{} rows but {} biases", layer.weights.len(), layer.bias.len()),
                });
            }
            let fan_in = layer.weights[0].len();
            if layer.weights.iter().any(|row| row.len() != fan_in) {
                return Err(ModelError::Layer {
                    layer: idx,
                    reason: "ragged weight rows".into(),
                });
            }
            if let Some(prev) = width {
                if prev != fan_in {
                    return Err(ModelError::Layer {
                        layer: idx,
                        reason: format!("expects {fan_in} inputs, previous layer gives {prev}"),
                    });
                }
            }
            width = Some(layer.weights.len());
        }
        Ok(())
    }
}

/// Load a [`DenseNet`] from `path`. No path, or a path that does not exist,
/// yields `fallback()` instead.
pub fn load_or(
    path: Option<&Path>,
    fallback: impl FnOnce() -> Box<dyn Regressor>,
) -> Result<Box<dyn Regressor>, ModelError> {
    match path {
        Some(path) if path.exists() => {
            let net = DenseNet::from_path(path)?;
            info!(
                path = %path.display(),
                inputs = net.input_len(),
                outputs = net.output_len(),
                "model loaded"
            );
            Ok(Box::new(net))
        }
        Some(path) => {
            warn!(path = %path.display(), "model file not found, using fallback");
            Ok(fallback())
        }
        None => Ok(fallback()),
    }
}

impl Regressor for DenseNet {
    fn input_len(&self) -> usize {
        self.layers.first().map(|l| l.weights[0].len()).unwrap_or(0)
    }

    fn output_len(&self) -> usize {
        self.layers.last().map(|l| l.weights.len()).unwrap_or(0)
    }

    fn predict(&self, features: &[f64]) -> Vec<f64> {
        let mut activations = features.to_vec();
        for layer in &self.layers {
            activations = layer
                .weights
                .iter()
                .zip(&layer.bias)
                .map(|(row, bias)| {
                    let sum: f64 = row.iter().zip(&activations).map(|(w, x)| w * x).sum();
                    match layer.activation {
                        Activation::Relu => (sum + bias).max(0.0),
                        Activation::Identity => sum + bias,
                    }
                })
                .collect();
        }
        activations
    }
}
