// src/policy/qnet.rs
//
// Small fully connected action-value network and its JSON artifact.
//
// Architecture: input scaling, then dense layers with ReLU between them
// and a linear output of one value per action. The same struct is trained
// by `rl::trainer` and served by `QNetPolicy`.

use std::fs;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{validate_state, Policy};
use crate::error::PolicyError;
use crate::types::Action;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const QNET_POLICY_VERSION: &str = "dqn-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub inputs: usize,
    pub outputs: usize,
    /// Row-major `outputs x inputs`.
    pub weights: Vec<f64>,
    pub bias: Vec<f64>,
}

impl DenseLayer {
    fn new<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let limit = (6.0 / inputs.max(1) as f64).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();
        Self {
            inputs,
            outputs,
            weights,
            bias: vec![0.0; outputs],
        }
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        (0..self.outputs)
            .map(|o| {
                let row = &self.weights[o * self.inputs..(o + 1) * self.inputs];
                row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>() + self.bias[o]
            })
            .collect()
    }
}

/// Per-layer gradients with the same shapes as the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub layers: Vec<(Vec<f64>, Vec<f64>)>,
}

impl Gradients {
    pub fn zeros_like(net: &QNetwork) -> Self {
        Self {
            layers: net
                .layers
                .iter()
                .map(|l| (vec![0.0; l.weights.len()], vec![0.0; l.bias.len()]))
                .collect(),
        }
    }

    pub fn add_assign(&mut self, other: &Gradients) {
        for ((w, b), (ow, ob)) in self.layers.iter_mut().zip(&other.layers) {
            w.iter_mut().zip(ow).for_each(|(a, b)| *a += b);
            b.iter_mut().zip(ob).for_each(|(a, b)| *a += b);
        }
    }

    pub fn scale(&mut self, k: f64) {
        for (w, b) in &mut self.layers {
            w.iter_mut().for_each(|v| *v *= k);
            b.iter_mut().for_each(|v| *v *= k);
        }
    }

    pub fn norm(&self) -> f64 {
        self.layers
            .iter()
            .flat_map(|(w, b)| w.iter().chain(b.iter()))
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt()
    }
}

/// Inputs and pre-activations recorded by `forward_trace`.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    inputs: Vec<Vec<f64>>,
    pre: Vec<Vec<f64>>,
    pub output: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QNetwork {
    pub format_version: u32,
    pub state_width: usize,
    pub action_count: usize,
    /// Multiplied into the raw state before the first layer.
    pub input_scale: Vec<f64>,
    pub layers: Vec<DenseLayer>,
}

impl QNetwork {
    /// Two hidden layers of `hidden` units.
    pub fn new<R: Rng>(state_width: usize, hidden: usize, input_scale: Vec<f64>, rng: &mut R) -> Self {
        let hidden = hidden.max(1);
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            state_width,
            action_count: Action::COUNT,
            input_scale,
            layers: vec![
                DenseLayer::new(state_width, hidden, rng),
                DenseLayer::new(hidden, hidden, rng),
                DenseLayer::new(hidden, Action::COUNT, rng),
            ],
        }
    }

    fn scaled(&self, state: &[f64]) -> Vec<f64> {
        state
            .iter()
            .zip(&self.input_scale)
            .map(|(x, s)| x * s)
            .collect()
    }

    pub fn forward(&self, state: &[f64]) -> Vec<f64> {
        self.forward_trace(state).output
    }

    pub fn forward_trace(&self, state: &[f64]) -> ForwardTrace {
        let last = self.layers.len().saturating_sub(1);
        let mut x = self.scaled(state);
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre = Vec::with_capacity(self.layers.len());
        for (l, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&x);
            inputs.push(std::mem::take(&mut x));
            x = if l == last {
                z.clone()
            } else {
                z.iter().map(|v| v.max(0.0)).collect()
            };
            pre.push(z);
        }
        ForwardTrace {
            inputs,
            pre,
            output: x,
        }
    }

    /// Backpropagate `grad_output` (dLoss/dOutput) through a recorded pass.
    pub fn backward(&self, trace: &ForwardTrace, grad_output: &[f64]) -> Gradients {
        let mut grads = Gradients::zeros_like(self);
        let mut delta = grad_output.to_vec();
        for l in (0..self.layers.len()).rev() {
            let layer = &self.layers[l];
            let x = &trace.inputs[l];
            let (gw, gb) = &mut grads.layers[l];
            for o in 0..layer.outputs {
                gb[o] = delta[o];
                for i in 0..layer.inputs {
                    gw[o * layer.inputs + i] = delta[o] * x[i];
                }
            }
            if l == 0 {
                break;
            }
            let mut prev = vec![0.0; layer.inputs];
            for o in 0..layer.outputs {
                for (i, p) in prev.iter_mut().enumerate() {
                    *p += layer.weights[o * layer.inputs + i] * delta[o];
                }
            }
            // ReLU derivative of the layer below.
            for (p, z) in prev.iter_mut().zip(&trace.pre[l - 1]) {
                if *z <= 0.0 {
                    *p = 0.0;
                }
            }
            delta = prev;
        }
        grads
    }

    /// Parameters as mutable `(weights, bias)` pairs, layer by layer.
    pub fn params_mut(&mut self) -> impl Iterator<Item = (&mut Vec<f64>, &mut Vec<f64>)> + '_ {
        self.layers.iter_mut().map(|l| (&mut l.weights, &mut l.bias))
    }

    /// Shape and finiteness checks run on every load.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(PolicyError::Load(format!(
                "unsupported artifact format {}",
                self.format_version
            )));
        }
        if self.action_count != Action::COUNT {
            return Err(PolicyError::Load(format!(
                "artifact has {} actions, expected {}",
                self.action_count,
                Action::COUNT
            )));
        }
        if self.input_scale.len() != self.state_width {
            return Err(PolicyError::Load("input scale width mismatch".to_string()));
        }
        let mut width = self.state_width;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.inputs != width
                || layer.weights.len() != layer.inputs * layer.outputs
                || layer.bias.len() != layer.outputs
            {
                return Err(PolicyError::Load(format!("layer {i} has inconsistent shape")));
            }
            if layer.weights.iter().chain(&layer.bias).any(|v| !v.is_finite()) {
                return Err(PolicyError::Load(format!("layer {i} has non-finite weights")));
            }
            width = layer.outputs;
        }
        if self.layers.is_empty() || width != self.action_count {
            return Err(PolicyError::Load("output width mismatch".to_string()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| PolicyError::Load(format!("{}: {err}", path.display())))?;
        let net: QNetwork = serde_json::from_str(&raw)
            .map_err(|err| PolicyError::Load(format!("{}: {err}", path.display())))?;
        net.validate()?;
        Ok(net)
    }

    /// Write via a temporary sibling file and rename.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}

/// Serves a trained `QNetwork`.
#[derive(Debug, Clone)]
pub struct QNetPolicy {
    net: QNetwork,
    version: String,
}

impl QNetPolicy {
    pub fn new(net: QNetwork) -> Self {
        Self {
            net,
            version: QNET_POLICY_VERSION.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        Ok(Self::new(QNetwork::load(path)?))
    }

    pub fn network(&self) -> &QNetwork {
        &self.net
    }
}

impl Policy for QNetPolicy {
    fn version(&self) -> &str {
        &self.version
    }

    fn state_width(&self) -> usize {
        self.net.state_width
    }

    fn scores(&self, state: &[f64]) -> Result<Vec<f64>, PolicyError> {
        validate_state(state, self.net.state_width)?;
        Ok(self.net.forward(state))
    }
}
