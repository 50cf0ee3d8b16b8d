use burn::tensor::{Tensor, backend::Backend};

use super::{OutputBase, OutputInput, Phase, pad_last_frame};
use crate::functional::{flatten_time_batch, masked_dense_nll, one_hot};
use crate::{Cost, GradTargets, LossError, LossName, OutputLayerConfig};

const EPSILON: f32 = 1e-30;

/// Outputs of the companion layer pair an [unsupervised output layer](UnsupervisedOutputLayer)
/// is built on, all `[time, batch, classes]`.
#[derive(Debug, Clone)]
pub struct CompanionPair<B: Backend> {
    /// Class conditional scores `p(x | c)`.
    pub class_conditional: Tensor<B, 3>,
    /// Scores of the negative model.
    pub negative: Tensor<B, 3>,
    /// Class posterior of the companion, treated as a constant.
    pub posterior: Tensor<B, 3>,
}

impl OutputLayerConfig {
    /// Initialize an [unsupervised output layer](UnsupervisedOutputLayer). With `oracle`, the
    /// layer trains on the labels even in the training phase.
    pub fn init_unsupervised(&self, oracle: bool) -> Result<UnsupervisedOutputLayer, LossError> {
        self.validate()?;
        if self.loss != LossName::Ce {
            return Err(LossError::InvalidLoss {
                layer: "unsupervised",
                loss: self.loss.to_string(),
            });
        }

        Ok(UnsupervisedOutputLayer {
            config: self.clone(),
            oracle,
        })
    }
}

/// Output layer with an EM style objective over a companion layer pair.
///
/// In training, the posterior of the companion weighs the class conditional scores against the
/// negative ones. Evaluation, or training with the oracle, falls back to the cross-entropy of
/// the normalized class conditional scores against the labels.
#[derive(Debug, Clone)]
pub struct UnsupervisedOutputLayer {
    config: OutputLayerConfig,
    oracle: bool,
}

impl UnsupervisedOutputLayer {
    /// The configuration.
    pub fn config(&self) -> &OutputLayerConfig {
        &self.config
    }

    /// Whether the layer trains on the labels.
    pub fn oracle(&self) -> bool {
        self.oracle
    }

    /// Compute the loss of the companion pair. The sources only provide the index.
    pub fn forward<B: Backend>(
        &self,
        pair: CompanionPair<B>,
        input: OutputInput<B>,
    ) -> Result<UnsupervisedOutput<B>, LossError> {
        let dims = pair.class_conditional.dims();
        if pair.negative.dims() != dims || pair.posterior.dims() != dims {
            return Err(LossError::ShapeMismatch(format!(
                "companion outputs {dims:?}, {:?} and {:?} differ",
                pair.negative.dims(),
                pair.posterior.dims()
            )));
        }
        let phase = input.phase;
        let posterior = normalize(pair.class_conditional.clone());
        let base = OutputBase::new(
            &self.config,
            posterior.clone().clamp(1e-38, 1e20).log(),
            input,
        )?;
        let [time, batch, classes] = base.z().dims();
        let posterior = flatten_time_batch(pad_last_frame(posterior, time));

        let loss = if phase == Phase::Train && !self.oracle {
            let mask = base.index().reshape([time, batch, 1]);
            em_objective(
                pad_last_frame(pair.class_conditional, time),
                pad_last_frame(pair.negative, time),
                pad_last_frame(pair.posterior, time).detach(),
                mask,
            )
        } else {
            let labels = base.flat_target().labels().ok_or(LossError::UnsupportedTarget {
                loss: "ce",
                target: base.target().kind_name(),
            })?;
            masked_dense_nll(posterior.clone(), one_hot(labels, classes), base.flat_index())
                .sum()
                .mul_scalar(base.norm())
        };
        let cost = Cost::automatic(Some(loss), base.policy());

        Ok(UnsupervisedOutput {
            base,
            posterior,
            cost,
        })
    }
}

/// Normalize `[time, batch, classes]` over the classes.
fn normalize<B: Backend>(scores: Tensor<B, 3>) -> Tensor<B, 3> {
    let total = scores.clone().sum_dim(2).add_scalar(EPSILON);
    scores.div(total)
}

/// Mean of `[time, batch, classes]` over the valid batch entries of each frame.
fn batch_mean<B: Backend>(tensor: Tensor<B, 3>, mask: Tensor<B, 3>) -> Tensor<B, 3> {
    let count = mask.clone().sum_dim(1).clamp_min(1.0);
    tensor.mul(mask).sum_dim(1).div(count)
}

fn em_objective<B: Backend>(
    class_conditional: Tensor<B, 3>,
    negative: Tensor<B, 3>,
    posterior: Tensor<B, 3>,
    mask: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let log = |tensor: Tensor<B, 3>| tensor.clamp_min(EPSILON).log();
    let complement = posterior.clone().neg().add_scalar(1.0);
    let hypothesis = batch_mean(normalize(class_conditional.clone()), mask.clone());
    let negative_hypothesis = batch_mean(normalize(negative.clone()), mask.clone());

    let prior_term = posterior
        .clone()
        .mul(log(hypothesis))
        .sum_dim(2)
        .add(complement.clone().mul(log(negative_hypothesis)).sum_dim(2));
    let evidence_term = log(class_conditional.mul(posterior).sum_dim(2))
        .add(log(negative.mul(complement).sum_dim(2)));

    prior_term.add(evidence_term).mul(mask).sum().neg()
}

/// Result of an [unsupervised output layer](UnsupervisedOutputLayer).
#[derive(Debug, Clone)]
pub struct UnsupervisedOutput<B: Backend> {
    base: OutputBase<B>,
    posterior: Tensor<B, 2>,
    cost: Cost<B>,
}

impl<B: Backend> UnsupervisedOutput<B> {
    /// The shared preprocessing. The scores are the log of the normalized class conditional
    /// scores.
    pub fn base(&self) -> &OutputBase<B> {
        &self.base
    }

    /// The loss.
    pub fn cost(&self) -> &Cost<B> {
        &self.cost
    }

    /// Normalized class conditional scores, `[time * batch, classes]`.
    pub fn posterior(&self) -> Tensor<B, 2> {
        self.posterior.clone()
    }

    /// Frame errors of the normalized scores against the labels.
    pub fn errors(&self) -> Result<Option<Tensor<B, 1>>, LossError> {
        self.base.errors(self.posterior.clone())
    }

    /// The tensors the gradients of the cost refer to.
    pub fn grad_targets(&self) -> GradTargets<B> {
        self.base.grad_targets(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Source, SourceActivation};
    use crate::{Target, TestBackend};
    use burn::tensor::{Bool, Int, TensorData, Tolerance, ops::FloatElem};

    type FT = FloatElem<TestBackend>;

    fn pair() -> CompanionPair<TestBackend> {
        let device = Default::default();
        CompanionPair {
            class_conditional: Tensor::from_floats([[[0.2, 0.6]]], &device),
            negative: Tensor::from_floats([[[0.5, 0.5]]], &device),
            posterior: Tensor::from_floats([[[0.5, 0.5]]], &device),
        }
    }

    fn input(phase: Phase) -> OutputInput<TestBackend> {
        let device = Default::default();
        let index = Tensor::<TestBackend, 2, Bool>::from_data(TensorData::from([[true]]), &device);
        let source = Source::new(
            SourceActivation::Dense(Tensor::zeros([1, 1, 2], &device)),
            index,
        );
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[1]], &device);
        OutputInput::new(vec![source], Target::Labels(labels)).with_phase(phase)
    }

    #[test]
    fn training_uses_the_em_objective() {
        let layer = OutputLayerConfig::new(2, LossName::Ce)
            .init_unsupervised(false)
            .unwrap();

        let output = layer.forward(pair(), input(Phase::Train)).unwrap();

        let expected = -(0.5 * 0.25f32.ln() + 0.5 * 0.75f32.ln())
            - 0.4f32.ln()
            + 2.0f32.ln()
            + 2.0f32.ln();
        output
            .cost()
            .loss
            .clone()
            .unwrap()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([expected]), Tolerance::default());
    }

    #[test]
    fn evaluation_falls_back_to_cross_entropy() {
        let layer = OutputLayerConfig::new(2, LossName::Ce)
            .init_unsupervised(false)
            .unwrap();

        let output = layer.forward(pair(), input(Phase::Eval)).unwrap();

        output
            .cost()
            .loss
            .clone()
            .unwrap()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([-(0.75f32.ln())]), Tolerance::default());
        output
            .errors()
            .unwrap()
            .unwrap()
            .into_data()
            .assert_eq(&TensorData::from([0.0]), false);
    }

    #[test]
    fn oracle_trains_on_the_labels() {
        let layer = OutputLayerConfig::new(2, LossName::Ce)
            .init_unsupervised(true)
            .unwrap();

        let output = layer.forward(pair(), input(Phase::Train)).unwrap();

        output
            .cost()
            .loss
            .clone()
            .unwrap()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([-(0.75f32.ln())]), Tolerance::default());
    }
}
