//! Multi-layer perceptron classifier and its hidden-size schedule.

use crate::config::ModelConfig;
use crate::error::FitError;
use candle_core::Tensor;
use candle_nn::{Dropout, Linear, ModuleT, VarBuilder};

/// Hidden layer sizes shrinking linearly from `input_size`.
///
/// `step = trunc(input_size / n_layers - 1)`, clamped at zero. The first hidden
/// layer has `input_size - step` units and each following one `step` fewer, for
/// `n_layers - 1` layers in total.
pub fn encoder_hidden_sizes(input_size: usize, n_layers: usize) -> Result<Vec<usize>, FitError> {
    if n_layers == 0 {
        return Err(FitError::config("n_layers must be at least 1"));
    }
    let step = (input_size as f64 / n_layers as f64 - 1.0).trunc().max(0.0) as usize;
    let mut sizes = Vec::with_capacity(n_layers - 1);
    let mut current = input_size.saturating_sub(step);
    for _ in 0..n_layers - 1 {
        sizes.push(current);
        current = current.saturating_sub(step);
    }
    Ok(sizes)
}

/// Linear layers with ReLU between them and optional dropout after each activation.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    dropout: Option<Dropout>,
}

impl Mlp {
    /// Build the network; weights are registered in `vb` as `fc{i}.weight` / `fc{i}.bias`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self, FitError> {
        let hidden = encoder_hidden_sizes(config.input_size, config.n_layers)?;
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(config.input_size);
        sizes.extend(hidden);
        sizes.push(config.output_size);

        if let Some(zero) = sizes.iter().position(|s| *s == 0) {
            return Err(FitError::model(format!("layer {zero} would have no units")));
        }

        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, w)| candle_nn::linear(w[0], w[1], vb.pp(format!("fc{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let dropout = config.use_dropout.then(|| Dropout::new(config.dropout_p));

        tracing::debug!(?sizes, dropout = config.use_dropout, "built classifier");
        Ok(Self { layers, dropout })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = candle_nn::Module::forward(layer, &xs)?;
            if i < last {
                xs = xs.relu()?;
                if let Some(dropout) = &self.dropout {
                    xs = dropout.forward_t(&xs, train)?;
                }
            }
        }
        Ok(xs)
    }
}
