use burn::tensor::{Tensor, backend::Backend};

use super::{OutputBase, OutputInput, SourceActivation, pad_last_frame};
use crate::functional::{flatten_time_batch, masked_nll};
use crate::{Cost, GradTargets, LossError, LossName, OutputLayerConfig};

impl OutputLayerConfig {
    /// Initialize a [decoder output layer](DecoderOutputLayer).
    pub fn init_decoder(&self) -> Result<DecoderOutputLayer, LossError> {
        self.validate()?;
        if self.loss != LossName::Ce {
            return Err(LossError::InvalidLoss {
                layer: "decoder",
                loss: self.loss.to_string(),
            });
        }

        Ok(DecoderOutputLayer {
            config: self.clone(),
        })
    }
}

/// Output layer summing the language model projections of its sources.
///
/// Each source comes with its own projection `[n_in, n_out]`, owned by the source. The layer
/// has no parameters; its loss is the mean of the cross-entropies of the projections.
#[derive(Debug, Clone)]
pub struct DecoderOutputLayer {
    config: OutputLayerConfig,
}

impl DecoderOutputLayer {
    /// The configuration.
    pub fn config(&self) -> &OutputLayerConfig {
        &self.config
    }

    /// Project every source with its language model weights and score the sum.
    ///
    /// # Shapes
    ///
    /// - lm_weights: one `[n_in_i, n_out]` per source
    /// - output scores: `[time, batch, n_out]`
    pub fn forward<B: Backend>(
        &self,
        lm_weights: &[Tensor<B, 2>],
        input: OutputInput<B>,
    ) -> Result<DecoderOutput<B>, LossError> {
        if lm_weights.len() != input.sources.len() || lm_weights.is_empty() {
            return Err(LossError::ShapeMismatch(format!(
                "{} language model projections for {} sources",
                lm_weights.len(),
                input.sources.len()
            )));
        }
        let projections = input
            .sources
            .iter()
            .zip(lm_weights)
            .enumerate()
            .map(|(i, (source, weight))| self.project(i, &source.activation, weight.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let z = projections
            .iter()
            .cloned()
            .reduce(|acc, projection| acc.add(projection))
            .ok_or_else(|| LossError::InvalidConfig("a decoder needs a source".into()))?;

        let base = OutputBase::new(&self.config, z, input)?;
        let labels = base.flat_target().labels().ok_or(LossError::UnsupportedTarget {
            loss: "ce",
            target: base.target().kind_name(),
        })?;
        let [time, _, _] = base.z().dims();
        let count = projections.len();
        let mask = base.flat_index();

        let loss = projections
            .into_iter()
            .map(|projection| {
                let projection = flatten_time_batch(pad_last_frame(projection, time));
                masked_nll(projection, labels.clone(), mask.clone()).sum()
            })
            .reduce(|acc, loss| acc.add(loss))
            .map(|loss| loss.mul_scalar(base.norm() / count as f32));
        let cost = Cost::automatic(loss, base.policy());

        Ok(DecoderOutput { base, cost })
    }

    fn project<B: Backend>(
        &self,
        i: usize,
        activation: &SourceActivation<B>,
        weight: Tensor<B, 2>,
    ) -> Result<Tensor<B, 3>, LossError> {
        let [n_in, n_out] = weight.dims();
        if n_out != self.config.n_out {
            return Err(LossError::ShapeMismatch(format!(
                "projection {i} has {n_out} outputs, the layer {}",
                self.config.n_out
            )));
        }
        let x = match activation {
            SourceActivation::Dense(x) => x.clone(),
            SourceActivation::Stacked(x) => {
                let [_, time, batch, features] = x.dims();
                x.clone().sum_dim(0).reshape([time, batch, features])
            }
            SourceActivation::Sparse(_) => {
                return Err(LossError::NotImplemented(
                    "language model projections of sparse sources".into(),
                ));
            }
        };
        let [time, batch, features] = x.dims();
        if features != n_in {
            return Err(LossError::ShapeMismatch(format!(
                "source {i} has {features} features, its projection expects {n_in}"
            )));
        }

        Ok(x.reshape([time * batch, features])
            .matmul(weight)
            .reshape([time, batch, n_out]))
    }
}

/// Result of a [decoder output layer](DecoderOutputLayer).
#[derive(Debug, Clone)]
pub struct DecoderOutput<B: Backend> {
    base: OutputBase<B>,
    cost: Cost<B>,
}

impl<B: Backend> DecoderOutput<B> {
    /// The shared preprocessing, holding the summed scores.
    pub fn base(&self) -> &OutputBase<B> {
        &self.base
    }

    /// Mean cross-entropy of the projections.
    pub fn cost(&self) -> &Cost<B> {
        &self.cost
    }

    /// Frame errors of the summed scores.
    pub fn errors(&self) -> Result<Option<Tensor<B, 1>>, LossError> {
        self.base.errors(self.base.flat_z())
    }

    /// The tensors the gradients of the cost refer to.
    pub fn grad_targets(&self) -> GradTargets<B> {
        self.base.grad_targets(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Source;
    use crate::{Target, TestBackend};
    use burn::tensor::{Bool, Int, TensorData, Tolerance, ops::FloatElem};

    type FT = FloatElem<TestBackend>;

    fn input(label: i64) -> OutputInput<TestBackend> {
        let device = Default::default();
        let index = Tensor::<TestBackend, 2, Bool>::from_data(TensorData::from([[true]]), &device);
        OutputInput::new(
            vec![
                Source::new(
                    SourceActivation::Dense(Tensor::from_floats([[[1.0, 0.0]]], &device)),
                    index.clone(),
                ),
                Source::new(
                    SourceActivation::Dense(Tensor::from_floats([[[0.0, 1.0]]], &device)),
                    index,
                ),
            ],
            Target::Labels(Tensor::<TestBackend, 2, Int>::from_ints([[label]], &device)),
        )
    }

    fn lm_weights() -> Vec<Tensor<TestBackend, 2>> {
        let device = Default::default();
        vec![
            Tensor::from_floats([[1.0, 0.0], [0.0, 1.0]], &device),
            Tensor::zeros([2, 2], &device),
        ]
    }

    #[test]
    fn loss_is_the_mean_over_projections() {
        let layer = OutputLayerConfig::new(2, LossName::Ce).init_decoder().unwrap();

        let output = layer.forward(&lm_weights(), input(0)).unwrap();

        let expected = ((1.0 + (-1.0f32).exp()).ln() + 2.0f32.ln()) / 2.0;
        output
            .cost()
            .loss
            .clone()
            .unwrap()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([expected]), Tolerance::default());
        output
            .base()
            .z()
            .into_data()
            .assert_eq(&TensorData::from([[[1.0, 0.0]]]), false);
    }

    #[test]
    fn errors_use_the_summed_scores() {
        let layer = OutputLayerConfig::new(2, LossName::Ce).init_decoder().unwrap();

        let output = layer.forward(&lm_weights(), input(1)).unwrap();

        output
            .errors()
            .unwrap()
            .unwrap()
            .into_data()
            .assert_eq(&TensorData::from([1.0]), false);
    }

    #[test]
    fn one_projection_per_source() {
        let layer = OutputLayerConfig::new(2, LossName::Ce).init_decoder().unwrap();

        let result = layer.forward(&lm_weights()[..1], input(0));

        assert!(matches!(result, Err(LossError::ShapeMismatch(_))));
    }

    #[test]
    fn only_cross_entropy_is_supported() {
        let result = OutputLayerConfig::new(2, LossName::Sse).init_decoder();

        assert!(matches!(
            result,
            Err(LossError::InvalidLoss { layer: "decoder", .. })
        ));
    }
}
