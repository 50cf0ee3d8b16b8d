use burn::tensor::{Tensor, backend::Backend};

use super::{OutputBase, OutputInput, OutputProjection, OutputProjectionConfig, Phase};
use crate::functional::{masked_dense_nll, masked_nll, masked_row_mean, one_hot};
use crate::ops::sparse_softmax_cross_entropy;
use crate::{
    Cost, FlatTarget, GradTargets, KnownGrads, LossError, LossName, OutputLayerConfig,
    RunningPrior, Target,
};

/// Loss of a [framewise output layer](FramewiseOutputLayer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramewiseCriterion {
    /// Cross-entropy per frame.
    CrossEntropy,
    /// Cross-entropy on batch entries with labels, self-entropy on the others.
    Entropy,
    /// Cross-entropy against the softmax divided by the prior.
    Priori,
    /// Squared error between the scores and the target.
    SumOfSquares,
    /// No loss.
    None,
}

impl FramewiseCriterion {
    /// Validate the configuration and select the criterion.
    pub fn from_config(config: &OutputLayerConfig) -> Result<Self, LossError> {
        config.validate()?;
        let criterion = match config.loss {
            LossName::Ce => Self::CrossEntropy,
            LossName::Entropy => Self::Entropy,
            LossName::Priori => Self::Priori,
            LossName::Sse => Self::SumOfSquares,
            LossName::None => Self::None,
            other => {
                return Err(LossError::InvalidLoss {
                    layer: "framewise",
                    loss: other.to_string(),
                });
            }
        };
        if !config.apply_softmax && criterion != Self::CrossEntropy {
            return Err(LossError::NotImplemented(format!(
                "the {} loss on probability inputs",
                config.loss
            )));
        }
        if config.log_prior.is_some() {
            log::warn!("log_prior is ignored by framewise output layers");
        }

        Ok(criterion)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::CrossEntropy => "ce",
            Self::Entropy => "entropy",
            Self::Priori => "priori",
            Self::SumOfSquares => "sse",
            Self::None => "none",
        }
    }
}

impl OutputLayerConfig {
    /// Initialize a [framewise output layer](FramewiseOutputLayer) fed by sources of the given
    /// feature sizes.
    pub fn init_framewise<B: Backend>(
        &self,
        n_inputs: &[usize],
        device: &B::Device,
    ) -> Result<FramewiseOutputLayer<B>, LossError> {
        let criterion = FramewiseCriterion::from_config(self)?;
        let projection = OutputProjectionConfig::new(n_inputs.to_vec(), self.n_out)
            .with_initializer(self.initializer.clone())
            .init(device);
        let prior = self.compute_priors.then(|| {
            RunningPrior::uniform(self.n_out, self.compute_priors_exp_average, device)
        });

        Ok(FramewiseOutputLayer {
            config: self.clone(),
            criterion,
            projection,
            prior,
        })
    }
}

/// Output layer with a loss per frame.
#[derive(Debug)]
pub struct FramewiseOutputLayer<B: Backend> {
    config: OutputLayerConfig,
    criterion: FramewiseCriterion,
    /// Maps the sources to the scores.
    pub projection: OutputProjection<B>,
    prior: Option<RunningPrior<B>>,
}

impl<B: Backend> FramewiseOutputLayer<B> {
    /// The configuration.
    pub fn config(&self) -> &OutputLayerConfig {
        &self.config
    }

    /// The criterion.
    pub fn criterion(&self) -> FramewiseCriterion {
        self.criterion
    }

    /// The running prior, with `compute_priors`.
    pub fn prior(&self) -> Option<&RunningPrior<B>> {
        self.prior.as_ref()
    }

    /// Project the sources and compute the loss.
    pub fn forward(&self, input: OutputInput<B>) -> Result<FramewiseOutput<B>, LossError> {
        let z = self.projection.forward(&input.sources, self.config.mass)?;
        self.forward_logits(z, input)
    }

    /// Compute the loss of given scores `[time, batch, n_out]`, or probabilities when
    /// `apply_softmax` is off. The sources only provide the index.
    pub fn forward_logits(
        &self,
        z: Tensor<B, 3>,
        input: OutputInput<B>,
    ) -> Result<FramewiseOutput<B>, LossError> {
        let base = OutputBase::new(&self.config, z, input)?;
        let probabilities = base.flat_probabilities();
        let view = match self.criterion {
            FramewiseCriterion::SumOfSquares => base.flat_z(),
            FramewiseCriterion::Priori => {
                let [_, classes] = probabilities.dims();
                let prior = match &self.prior {
                    Some(prior) => prior.priors(),
                    None => Tensor::ones([classes], &probabilities.device()),
                };
                probabilities.clone().div(prior.reshape([1, classes]))
            }
            _ => probabilities.clone(),
        };

        let cost = self.cost(&base, view.clone())?;
        let prior_update = match (&self.prior, base.phase()) {
            (Some(_), Phase::Train) => Some(masked_row_mean(
                probabilities.detach(),
                base.flat_index(),
            )),
            _ => None,
        };

        Ok(FramewiseOutput {
            base,
            view,
            cost,
            prior_update,
        })
    }

    /// Fold the prior estimate of a training step into the running prior.
    pub fn update_priors(&mut self, output: &FramewiseOutput<B>) {
        if let (Some(prior), Some(estimate)) = (&mut self.prior, &output.prior_update) {
            prior.update(estimate.clone());
        }
    }

    fn unsupported(&self, target: &Target<B>) -> LossError {
        LossError::UnsupportedTarget {
            loss: self.criterion.name(),
            target: target.kind_name(),
        }
    }

    fn cost(&self, base: &OutputBase<B>, view: Tensor<B, 2>) -> Result<Cost<B>, LossError> {
        let policy = base.policy();
        let mask = base.flat_index();
        let norm = base.norm();
        let [rows, classes] = view.dims();

        let loss = match self.criterion {
            FramewiseCriterion::None => return Ok(Cost::automatic(None, policy)),
            FramewiseCriterion::CrossEntropy => {
                if let Target::Sparse(sparse) = base.target() {
                    let [time, batch, _] = base.z().dims();
                    let targets = sparse.to_dense(time, classes).reshape([rows, classes]);
                    let (loss, grad) =
                        sparse_softmax_cross_entropy(base.flat_z(), targets, mask);
                    let grad = grad.mul_scalar(norm).reshape([time, batch, classes]);
                    return Ok(Cost::with_known_grads(
                        Some(loss.sum().mul_scalar(norm)),
                        KnownGrads::new().with_logits(grad),
                        policy,
                    ));
                }
                if base.raw_probabilities().is_some() {
                    return self.probability_cross_entropy(base, view);
                }
                let nll = match base.flat_target() {
                    FlatTarget::Dense(targets) => masked_dense_nll(view, targets.clone(), mask),
                    FlatTarget::None => return Err(self.unsupported(base.target())),
                    flat => {
                        let labels = flat
                            .labels()
                            .ok_or_else(|| self.unsupported(base.target()))?;
                        masked_nll(base.flat_z(), labels, mask)
                    }
                };
                nll.sum().mul_scalar(norm)
            }
            FramewiseCriterion::Entropy => {
                let labels = base
                    .flat_target()
                    .labels()
                    .ok_or_else(|| self.unsupported(base.target()))?;
                let [time, batch] = base.index().dims();
                let ce = masked_nll(base.flat_z(), labels.clone(), mask.clone())
                    .reshape([time, batch])
                    .sum_dim(0);
                let clipped = view.clamp(1e-6, 1e6);
                let log_p = clipped.clone().log();
                let self_entropy = clipped
                    .mul(log_p)
                    .sum_dim(1)
                    .reshape([rows])
                    .neg()
                    .mul(mask.clone())
                    .reshape([time, batch])
                    .sum_dim(0);
                let labelled = labels
                    .float()
                    .mul(mask)
                    .reshape([time, batch])
                    .max_dim(0)
                    .greater_elem(0.0)
                    .float();

                labelled
                    .clone()
                    .mul(ce)
                    .add(labelled.neg().add_scalar(1.0).mul(self_entropy))
                    .sum()
            }
            FramewiseCriterion::Priori => {
                let labels = base
                    .flat_target()
                    .labels()
                    .ok_or_else(|| self.unsupported(base.target()))?;
                masked_dense_nll(view, one_hot(labels, classes), mask)
                    .sum()
                    .mul_scalar(norm)
            }
            FramewiseCriterion::SumOfSquares => match base.flat_target() {
                FlatTarget::Dense(targets) => {
                    if targets.dims() != [rows, classes] {
                        return Err(LossError::ShapeMismatch(format!(
                            "dense target {:?} for scores {:?}",
                            targets.dims(),
                            [rows, classes]
                        )));
                    }
                    view.sub(targets.clone())
                        .powf_scalar(2.0)
                        .mean_dim(1)
                        .reshape([rows])
                        .mul(mask)
                        .sum()
                }
                FlatTarget::None => return Err(self.unsupported(base.target())),
                flat => {
                    let labels = flat
                        .labels()
                        .ok_or_else(|| self.unsupported(base.target()))?;
                    let count = mask.clone().sum().clamp_min(1.0).mul_scalar(classes as f32);
                    view.sub(one_hot(labels, classes))
                        .powf_scalar(2.0)
                        .mul(mask.reshape([rows, 1]))
                        .sum()
                        .div(count)
                }
            },
        };

        Ok(Cost::automatic(Some(loss), policy))
    }

    /// Cross-entropy on probability inputs, with the gradient `-y / p` on valid frames given
    /// for the probabilities.
    fn probability_cross_entropy(
        &self,
        base: &OutputBase<B>,
        probabilities: Tensor<B, 2>,
    ) -> Result<Cost<B>, LossError> {
        let mask = base.flat_index();
        let [rows, classes] = probabilities.dims();
        let targets = match base.flat_target() {
            FlatTarget::Dense(targets) => targets.clone(),
            FlatTarget::None => return Err(self.unsupported(base.target())),
            flat => one_hot(
                flat.labels()
                    .ok_or_else(|| self.unsupported(base.target()))?,
                classes,
            ),
        };

        let loss = masked_dense_nll(probabilities.clone(), targets.clone(), mask.clone())
            .sum()
            .mul_scalar(base.norm());
        let grad = targets
            .div(probabilities.detach().clamp(1e-38, 1e20))
            .neg()
            .mul(mask.reshape([rows, 1]))
            .mul_scalar(base.norm());

        Ok(Cost::with_known_grads(
            Some(loss),
            KnownGrads::new().with_probabilities(grad),
            base.policy(),
        ))
    }
}

/// Result of a [framewise output layer](FramewiseOutputLayer) for one batch.
#[derive(Debug, Clone)]
pub struct FramewiseOutput<B: Backend> {
    base: OutputBase<B>,
    view: Tensor<B, 2>,
    cost: Cost<B>,
    prior_update: Option<Tensor<B, 1>>,
}

impl<B: Backend> FramewiseOutput<B> {
    /// The shared preprocessing.
    pub fn base(&self) -> &OutputBase<B> {
        &self.base
    }

    /// Loss and known gradients.
    pub fn cost(&self) -> &Cost<B> {
        &self.cost
    }

    /// Frame errors, see [OutputBase::errors].
    pub fn errors(&self) -> Result<Option<Tensor<B, 1>>, LossError> {
        self.base.errors(self.view.clone())
    }

    /// Entropy of the predictions over valid frames.
    pub fn entropy(&self) -> Tensor<B, 1> {
        self.base.entropy(self.base.flat_probabilities())
    }

    /// The probability view `[time, batch, n_out]`: the softmax, the softmax divided by the
    /// prior for `priori`, the scores for `sse`, or the input probabilities.
    pub fn output(&self) -> Tensor<B, 3> {
        let [time, batch, classes] = self.base.z().dims();
        self.view.clone().reshape([time, batch, classes])
    }

    /// The tensors the known gradients refer to.
    pub fn grad_targets(&self) -> GradTargets<B> {
        let probabilities = self
            .base
            .raw_probabilities()
            .is_some()
            .then(|| self.view.clone());
        self.base.grad_targets(probabilities, None)
    }

    /// Mean prediction over the valid frames, when the layer tracks a prior in training.
    pub fn prior_update(&self) -> Option<Tensor<B, 1>> {
        self.prior_update.clone()
    }
}
