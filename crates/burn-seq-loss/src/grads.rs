use burn::tensor::{
    Tensor,
    backend::{AutodiffBackend, Backend},
};

use crate::LossError;

/// Transformation applied to every gradient reaching the logits.
///
/// The gradient is first zeroed where `|z|` exceeds the discard bound, then clipped to
/// `[-clip, clip]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogitsGradPolicy {
    /// Clip bound.
    pub clip: Option<f32>,
    /// Discard bound.
    pub discard_out_of_bound: Option<f32>,
}

impl LogitsGradPolicy {
    /// Whether the policy leaves gradients untouched.
    pub fn is_identity(&self) -> bool {
        self.clip.is_none() && self.discard_out_of_bound.is_none()
    }

    /// Apply the policy to `grad`, the gradient w.r.t. `logits`.
    pub fn apply<B: Backend, const D: usize>(
        &self,
        grad: Tensor<B, D>,
        logits: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let grad = match self.discard_out_of_bound {
            Some(bound) => grad.mask_fill(logits.abs().greater_elem(bound), 0.0),
            None => grad,
        };

        match self.clip {
            Some(clip) => grad.clamp(-clip, clip),
            None => grad,
        }
    }
}

/// Tensors a [known gradient](KnownGrads) can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradTarget {
    /// The logits `z`, `[time, batch, classes]`.
    Logits,
    /// The flat probability view, `[time * batch, classes]`.
    Probabilities,
    /// The trainable logits of a softmax prior, `[classes]`.
    SoftmaxPrior,
}

/// Gradients supplied by a loss instead of the ones automatic differentiation would derive.
///
/// A known gradient for a tensor replaces the whole gradient reaching that tensor: the backward
/// pass starts from the known values and continues into whatever produced the tensor.
#[derive(Debug, Clone)]
pub struct KnownGrads<B: Backend> {
    logits: Option<Tensor<B, 3>>,
    probabilities: Option<Tensor<B, 2>>,
    softmax_prior: Option<Tensor<B, 1>>,
}

impl<B: Backend> Default for KnownGrads<B> {
    fn default() -> Self {
        Self {
            logits: None,
            probabilities: None,
            softmax_prior: None,
        }
    }
}

impl<B: Backend> KnownGrads<B> {
    /// No known gradient.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gradient of the logits.
    pub fn with_logits(mut self, grad: Tensor<B, 3>) -> Self {
        self.logits = Some(grad.detach());
        self
    }

    /// Set the gradient of the probability view.
    pub fn with_probabilities(mut self, grad: Tensor<B, 2>) -> Self {
        self.probabilities = Some(grad.detach());
        self
    }

    /// Set the gradient of the softmax prior logits.
    pub fn with_softmax_prior(mut self, grad: Tensor<B, 1>) -> Self {
        self.softmax_prior = Some(grad.detach());
        self
    }

    /// Known gradient of the logits.
    pub fn logits(&self) -> Option<&Tensor<B, 3>> {
        self.logits.as_ref()
    }

    /// Known gradient of the probability view.
    pub fn probabilities(&self) -> Option<&Tensor<B, 2>> {
        self.probabilities.as_ref()
    }

    /// Known gradient of the softmax prior logits.
    pub fn softmax_prior(&self) -> Option<&Tensor<B, 1>> {
        self.softmax_prior.as_ref()
    }

    /// Whether no gradient is known.
    pub fn is_empty(&self) -> bool {
        self.targets().is_empty()
    }

    /// Tensors with a known gradient.
    pub fn targets(&self) -> Vec<GradTarget> {
        let mut targets = Vec::new();
        if self.logits.is_some() {
            targets.push(GradTarget::Logits);
        }
        if self.probabilities.is_some() {
            targets.push(GradTarget::Probabilities);
        }
        if self.softmax_prior.is_some() {
            targets.push(GradTarget::SoftmaxPrior);
        }
        targets
    }
}

/// The tensors of one forward pass that known gradients are attached to.
#[derive(Debug, Clone)]
pub struct GradTargets<B: Backend> {
    /// The logits, connected to the sources.
    pub logits: Tensor<B, 3>,
    /// The detached copy of the logits the loss is computed on, when a gradient policy applies.
    pub detached_logits: Option<Tensor<B, 3>>,
    /// The flat probability view, when the layer takes probabilities as input.
    pub probabilities: Option<Tensor<B, 2>>,
    /// The softmax prior logits, when the prior is trained.
    pub softmax_prior: Option<Tensor<B, 1>>,
}

/// Loss value of an output layer together with its gradient side channel.
#[derive(Debug, Clone)]
pub struct Cost<B: Backend> {
    /// Scalar loss, `None` for scoring only criteria.
    pub loss: Option<Tensor<B, 1>>,
    /// Gradients replacing the automatic ones.
    pub known_grads: KnownGrads<B>,
    /// Class occupation counts reported by the CTC operator.
    pub ctc_priors: Option<Tensor<B, 1>>,
    /// Soft alignment computed by a Baum-Welch criterion, `[time, batch, classes]`.
    pub alignment: Option<Tensor<B, 3>>,
    /// Policy applied to every gradient reaching the logits.
    pub policy: LogitsGradPolicy,
}

impl<B: Backend> Cost<B> {
    /// A cost whose gradient comes from automatic differentiation.
    pub fn automatic(loss: Option<Tensor<B, 1>>, policy: LogitsGradPolicy) -> Self {
        Self {
            loss,
            known_grads: KnownGrads::new(),
            ctc_priors: None,
            alignment: None,
            policy,
        }
    }

    /// A cost with known gradients.
    pub fn with_known_grads(
        loss: Option<Tensor<B, 1>>,
        known_grads: KnownGrads<B>,
        policy: LogitsGradPolicy,
    ) -> Self {
        Self {
            known_grads,
            ..Self::automatic(loss, policy)
        }
    }

    /// Scalar whose gradient w.r.t. each target equals its known gradient.
    ///
    /// `sum(x * g)` with `g` detached has gradient `g` w.r.t. `x`. Returns `None` when no gradient
    /// is known.
    pub fn surrogate(&self, targets: &GradTargets<B>) -> Result<Option<Tensor<B, 1>>, LossError> {
        let mut terms = Vec::new();

        if let Some(grad) = &self.known_grads.logits {
            let logits = targets.logits.clone();
            let grad = self.policy.apply(grad.clone(), logits.clone().detach());
            terms.push(logits.mul(grad).sum());
        }
        if let Some(grad) = &self.known_grads.probabilities {
            let probabilities = targets.probabilities.clone().ok_or_else(|| {
                LossError::MissingDependency(
                    "a probability gradient needs the probability view".into(),
                )
            })?;
            let grad = self.policy.apply(grad.clone(), probabilities.clone().detach());
            terms.push(probabilities.mul(grad).sum());
        }
        if let Some(grad) = &self.known_grads.softmax_prior {
            let prior = targets.softmax_prior.clone().ok_or_else(|| {
                LossError::MissingDependency(
                    "a prior gradient needs the trained softmax prior".into(),
                )
            })?;
            terms.push(prior.mul(grad.clone()).sum());
        }

        Ok(terms.into_iter().reduce(|acc, term| acc.add(term)))
    }
}

impl<B: AutodiffBackend> Cost<B> {
    /// Gradient reaching the logits, after the gradient policy.
    ///
    /// Uses the known logits gradient when there is one, and differentiates the loss otherwise.
    pub fn logits_grad(
        &self,
        logits: &Tensor<B, 3>,
    ) -> Option<Tensor<B::InnerBackend, 3>> {
        let inner = logits.clone().inner();
        let grad = match &self.known_grads.logits {
            Some(grad) => grad.clone().inner(),
            None => {
                let grads = self.loss.clone()?.backward();
                logits.grad(&grads)?
            }
        };

        Some(self.policy.apply(grad, inner))
    }

    /// Run the backward pass of the training objective.
    ///
    /// Known gradients are injected through their [surrogate](Cost::surrogate). Without known
    /// gradients the loss is differentiated directly. When the loss was computed on
    /// [detached logits](GradTargets::detached_logits), their gradient goes through the policy
    /// and continues into the sources, and the gradient of the softmax prior is carried over.
    pub fn backward(&self, targets: &GradTargets<B>) -> Result<Option<B::Gradients>, LossError> {
        if let Some(surrogate) = self.surrogate(targets)? {
            return Ok(Some(surrogate.backward()));
        }
        let Some(loss) = &self.loss else {
            return Ok(None);
        };
        let mut grads = loss.clone().backward();
        let Some(detached) = &targets.detached_logits else {
            return Ok(Some(grads));
        };
        let Some(grad) = detached.grad_remove(&mut grads) else {
            return Ok(Some(grads));
        };

        let grad = self.policy.apply(grad, detached.clone().inner());
        let mut sources = targets
            .logits
            .clone()
            .mul(Tensor::from_inner(grad))
            .sum()
            .backward();
        if let Some(prior) = &targets.softmax_prior {
            if let Some(grad) = prior.grad_remove(&mut grads) {
                let grad = match prior.grad(&sources) {
                    Some(existing) => existing.add(grad),
                    None => grad,
                };
                prior.grad_replace(&mut sources, grad);
            }
        }

        Ok(Some(sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::tensor::{TensorData, Tolerance, ops::FloatElem};

    type FT = FloatElem<TestBackend>;

    #[test]
    fn policy_discards_then_clips() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([0.5, 3.0, -0.5], &device);
        let grad = Tensor::<TestBackend, 1>::from_floats([2.0, 1.0, -0.2], &device);
        let policy = LogitsGradPolicy {
            clip: Some(1.0),
            discard_out_of_bound: Some(2.0),
        };

        let grad = policy.apply(grad, logits);

        grad.into_data()
            .assert_eq(&TensorData::from([1.0, 0.0, -0.2]), false);
    }

    #[test]
    fn surrogate_injects_known_logits_gradient() {
        let device = Default::default();
        let logits = Tensor::<TestAutodiffBackend, 3>::from_floats([[[1.0, 2.0]]], &device)
            .require_grad();
        let known = Tensor::<TestAutodiffBackend, 3>::from_floats([[[0.25, -0.25]]], &device);
        let cost = Cost::with_known_grads(
            Some(logits.clone().sum()),
            KnownGrads::new().with_logits(known),
            LogitsGradPolicy::default(),
        );
        let targets = GradTargets {
            logits: logits.clone(),
            detached_logits: None,
            probabilities: None,
            softmax_prior: None,
        };

        let grads = cost.backward(&targets).unwrap().unwrap();
        let grad = logits.grad(&grads).unwrap();

        grad.into_data().assert_approx_eq::<FT>(
            &TensorData::from([[[0.25, -0.25]]]),
            Tolerance::default(),
        );
    }

    #[test]
    fn automatic_gradient_goes_through_the_policy() {
        let device = Default::default();
        let logits = Tensor::<TestAutodiffBackend, 3>::from_floats([[[1.0, 5.0]]], &device)
            .require_grad();
        let loss = logits.clone().mul_scalar(3.0).sum();
        let cost = Cost::automatic(
            Some(loss),
            LogitsGradPolicy {
                clip: Some(2.0),
                discard_out_of_bound: Some(4.0),
            },
        );

        let grad = cost.logits_grad(&logits).unwrap();

        grad.into_data()
            .assert_approx_eq::<FT>(&TensorData::from([[[2.0, 0.0]]]), Tolerance::default());
    }

    #[test]
    fn policy_rewrites_the_logits_gradient_and_keeps_the_prior_gradient() {
        let device = Default::default();
        let weight = Tensor::<TestAutodiffBackend, 3>::from_floats([[[1.0, -1.0]]], &device)
            .require_grad();
        let prior = Tensor::<TestAutodiffBackend, 1>::from_floats([0.0, 0.0], &device)
            .require_grad();
        let logits = weight.clone().mul_scalar(3.0);
        let detached = logits.clone().detach().require_grad();
        let loss = detached
            .clone()
            .mul_scalar(5.0)
            .sum()
            .add(prior.clone().mul_scalar(2.0).sum());
        let cost = Cost::automatic(
            Some(loss),
            LogitsGradPolicy {
                clip: Some(1.0),
                discard_out_of_bound: None,
            },
        );
        let targets = GradTargets {
            logits,
            detached_logits: Some(detached),
            probabilities: None,
            softmax_prior: Some(prior.clone()),
        };

        let grads = cost.backward(&targets).unwrap().unwrap();

        weight
            .grad(&grads)
            .unwrap()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([[[3.0, 3.0]]]), Tolerance::default());
        prior
            .grad(&grads)
            .unwrap()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([2.0, 2.0]), Tolerance::default());
    }

    #[test]
    fn probability_gradient_needs_its_target() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::zeros([1, 1, 2], &device);
        let cost = Cost::with_known_grads(
            None,
            KnownGrads::new().with_probabilities(Tensor::zeros([1, 2], &device)),
            LogitsGradPolicy::default(),
        );

        let result = cost.surrogate(&GradTargets {
            logits,
            detached_logits: None,
            probabilities: None,
            softmax_prior: None,
        });

        assert!(matches!(result, Err(LossError::MissingDependency(_))));
    }
}
