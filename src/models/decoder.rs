use std::sync::Arc;

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig, LstmState};
use burn::tensor::{backend::Backend, Tensor};

use super::pooling::{InteractionPooling, InteractionPoolingConfig};
use crate::data::batchitem::SceneRange;

use crate::geometry::SceneGeometryStore;
use crate::modules::activation::ActivationKind;
use crate::modules::mlp::{Mlp, MlpConfig};

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    spatial_embedding: Linear<B>,
    layers: Vec<Lstm<B>>,
    hidden2pos: Linear<B>,
    pooling: Option<InteractionPooling<B>>,
    mlp: Option<Mlp<B>>,
    pred_len: usize,
    h_dim: usize,
}

impl<B: Backend> Decoder<B> {
    /// Rolls out `pred_len` steps from the last observed position.
    ///
    /// Every layer starts from `decoder_h` with a zero cell. Returns the
    /// predicted relative displacements `[N, pred_len, 2]` and the final top
    /// layer hidden state.
    pub fn forward(
        &self,
        last_pos: Tensor<B, 2>,     // [N, 2]
        last_pos_rel: Tensor<B, 2>, // [N, 2]
        decoder_h: Tensor<B, 2>,    // [N, h]
        ranges: &[SceneRange],
        scene_ids: &[usize],
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let [num_peds, _] = decoder_h.dims();
        let device = decoder_h.device();

        let mut states: Vec<LstmState<B, 2>> = self
            .layers
            .iter()
            .map(|_| {
                LstmState::new(
                    Tensor::zeros([num_peds, self.h_dim], &device),
                    decoder_h.clone(),
                )
            })
            .collect();

        let mut last_pos = last_pos;
        let mut decoder_input: Tensor<B, 3> =
            self.spatial_embedding.forward(last_pos_rel).unsqueeze_dim(1);
        let mut predictions = Vec::with_capacity(self.pred_len);

        for _ in 0..self.pred_len {
            let mut x = decoder_input;
            let mut next_states = Vec::with_capacity(states.len());
            for (lstm, state) in self.layers.iter().zip(states) {
                let (output, state) = lstm.forward(x, Some(state));
                x = output;
                next_states.push(state);
            }

            let output: Tensor<B, 2> = x.squeeze(1);
            let rel_pos = self.hidden2pos.forward(output);
            let curr_pos = rel_pos.clone() + last_pos;

            if let (Some(pooling), Some(mlp)) = (&self.pooling, &self.mlp) {
                if let Some(top) = next_states.pop() {
                    let pooled = pooling.forward(
                        top.hidden.clone(),
                        curr_pos.clone(),
                        rel_pos.clone(),
                        ranges,
                        scene_ids,
                    );
                    let hidden = match pooled {
                        Some(pooled) => mlp.forward(Tensor::cat(vec![top.hidden, pooled], 1)),
                        None => top.hidden,
                    };
                    next_states.push(LstmState::new(top.cell, hidden));
                }
            }
            states = next_states;

            decoder_input = self.spatial_embedding.forward(rel_pos.clone()).unsqueeze_dim(1);
            predictions.push(rel_pos);
            last_pos = curr_pos;
        }

        let final_h = match states.pop() {
            Some(state) => state.hidden,
            None => decoder_h,
        };

        (Tensor::stack(predictions, 1), final_h)
    }
}

#[derive(Config, Debug)]
pub struct DecoderConfig {
    pred_len: usize,

    #[config(default = 16)]
    embedding_dim: usize,

    #[config(default = 32)]
    h_dim: usize,

    #[config(default = 16)]
    mlp_dim: usize,

    #[config(default = 1)]
    num_layers: usize,

    /// Pooling re-applied after every step; `None` disables it.
    pooling: Option<InteractionPoolingConfig>,

    #[config(default = "ActivationKind::LeakyRelu")]
    activation: ActivationKind,

    #[config(default = true)]
    batch_norm: bool,

    #[config(default = 0.0)]
    dropout: f64,
}

impl DecoderConfig {
    pub fn init<B: Backend>(
        &self,
        geometry: Option<Arc<SceneGeometryStore>>,
        device: &B::Device,
    ) -> crate::error::Result<Decoder<B>> {
        let layers = (0..self.num_layers.max(1))
            .map(|layer| {
                let d_input = if layer == 0 { self.embedding_dim } else { self.h_dim };
                LstmConfig::new(d_input, self.h_dim, true).init(device)
            })
            .collect();

        let pooling = match &self.pooling {
            Some(config) => Some(config.init(geometry, device)?),
            None => None,
        };
        let pooling = pooling.filter(|pooling: &InteractionPooling<B>| pooling.is_enabled());
        let mlp = pooling.as_ref().map(|pooling| {
            MlpConfig::new(vec![
                self.h_dim + pooling.output_dim(),
                self.mlp_dim,
                self.h_dim,
            ])
            .with_activation(self.activation)
            .with_batch_norm(self.batch_norm)
            .with_dropout(self.dropout)
            .init(device)
        });

        Ok(Decoder {
            spatial_embedding: LinearConfig::new(2, self.embedding_dim).init(device),
            layers,
            hidden2pos: LinearConfig::new(self.h_dim, 2).init(device),
            pooling,
            mlp,
            pred_len: self.pred_len,
            h_dim: self.h_dim,
        })
    }
}
