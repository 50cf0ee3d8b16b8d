use std::path::Path;

use burn::module::{Module, Param};
use burn::tensor::{Tensor, activation, backend::Backend};

use crate::{LossError, OutputLayerConfig, data::float_tensor};

/// Read a log prior table: one value per non-empty line, one line per class.
pub fn load_log_prior(path: impl AsRef<Path>, n_out: usize) -> Result<Vec<f32>, LossError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|err| LossError::PriorFile {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;

    let values = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<f32>().map_err(|err| LossError::PriorFile {
                path: path.display().to_string(),
                reason: format!("{line:?}: {err}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if values.len() != n_out {
        return Err(LossError::PriorDimMismatch {
            expected: n_out,
            actual: values.len(),
        });
    }
    log::info!("Loaded {} log priors from {}", values.len(), path.display());

    Ok(values)
}

/// Class prior estimated from the predictions, updated once per training step.
#[derive(Debug, Clone)]
pub struct RunningPrior<B: Backend> {
    priors: Tensor<B, 1>,
    updates: usize,
    exp_average: f32,
}

impl<B: Backend> RunningPrior<B> {
    /// Start from the given distribution.
    ///
    /// With `exp_average` in `(0, 1]`, each update moves the prior by that fraction towards the
    /// batch estimate. With `0` the prior is the mean of all batch estimates seen so far.
    pub fn new(initial: Tensor<B, 1>, exp_average: f32) -> Self {
        Self {
            priors: initial.detach(),
            updates: 0,
            exp_average,
        }
    }

    /// Start from the uniform distribution.
    pub fn uniform(n_out: usize, exp_average: f32, device: &B::Device) -> Self {
        Self::new(Tensor::full([n_out], 1.0 / n_out as f32, device), exp_average)
    }

    /// Start from zeros.
    pub fn zeros(n_out: usize, exp_average: f32, device: &B::Device) -> Self {
        Self::new(Tensor::zeros([n_out], device), exp_average)
    }

    /// Current prior.
    pub fn priors(&self) -> Tensor<B, 1> {
        self.priors.clone()
    }

    /// Log of the current prior, floored at `1e-38`.
    pub fn log_priors(&self) -> Tensor<B, 1> {
        self.priors.clone().clamp_min(1e-38).log()
    }

    /// Number of applied updates.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Fold in the class distribution estimated on one batch.
    pub fn update(&mut self, estimate: Tensor<B, 1>) {
        let estimate = estimate.detach();
        self.priors = if self.exp_average > 0.0 {
            self.priors
                .clone()
                .mul_scalar(1.0 - self.exp_average)
                .add(estimate.mul_scalar(self.exp_average))
        } else {
            let seen = self.updates as f32;
            self.priors
                .clone()
                .mul_scalar(seen)
                .add(estimate)
                .div_scalar(seen + 1.0)
        };
        self.updates += 1;
        log::debug!("Prior update {}", self.updates);
    }
}

/// Prior learned as the softmax of trainable logits.
#[derive(Module, Debug)]
pub struct SoftmaxPrior<B: Backend> {
    /// Unnormalized log prior.
    pub logits: Param<Tensor<B, 1>>,
}

impl<B: Backend> SoftmaxPrior<B> {
    /// Create from initial logits.
    pub fn new(initial: Tensor<B, 1>) -> Self {
        Self {
            logits: Param::from_tensor(initial),
        }
    }

    /// `softmax(logits)`.
    pub fn priors(&self) -> Tensor<B, 1> {
        activation::softmax(self.logits.val(), 0)
    }

    /// `log(softmax(logits))`.
    pub fn log_priors(&self) -> Tensor<B, 1> {
        activation::log_softmax(self.logits.val(), 0)
    }
}

/// Class prior of a sequence output layer.
#[derive(Debug)]
pub enum Prior<B: Backend> {
    /// Log prior read from a file.
    Fixed(Tensor<B, 1>),
    /// Running average of the predictions.
    Running(RunningPrior<B>),
    /// Trainable softmax prior.
    Trained(SoftmaxPrior<B>),
}

impl<B: Backend> Prior<B> {
    /// Build the prior selected by the configuration, if any.
    ///
    /// `compute_priors` wins over `log_prior`. A trained prior starts from `log_prior` when it
    /// is given, from zeros otherwise.
    pub fn from_config(
        config: &OutputLayerConfig,
        device: &B::Device,
    ) -> Result<Option<Self>, LossError> {
        let log_prior = config
            .log_prior
            .as_ref()
            .map(|path| load_log_prior(path, config.n_out))
            .transpose()?;

        let prior = if config.compute_priors {
            Some(Self::Running(RunningPrior::uniform(
                config.n_out,
                config.compute_priors_exp_average,
                device,
            )))
        } else if config.trained_softmax_prior {
            let initial = match log_prior {
                Some(values) => float_tensor(values, [config.n_out], device),
                None => Tensor::zeros([config.n_out], device),
            };
            Some(Self::Trained(SoftmaxPrior::new(initial)))
        } else {
            log_prior.map(|values| Self::Fixed(float_tensor(values, [config.n_out], device)))
        };

        Ok(prior)
    }

    /// The prior in log space.
    pub fn log_priors(&self) -> Tensor<B, 1> {
        match self {
            Self::Fixed(log_prior) => log_prior.clone(),
            Self::Running(prior) => prior.log_priors(),
            Self::Trained(prior) => prior.log_priors(),
        }
    }

    /// The prior as a distribution.
    pub fn priors(&self) -> Tensor<B, 1> {
        match self {
            Self::Fixed(log_prior) => log_prior.clone().exp(),
            Self::Running(prior) => prior.priors(),
            Self::Trained(prior) => prior.priors(),
        }
    }

    /// The trainable logits, for a trained prior.
    pub fn trainable_logits(&self) -> Option<Tensor<B, 1>> {
        match self {
            Self::Trained(prior) => Some(prior.logits.val()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LossName, TestBackend};
    use burn::tensor::{TensorData, Tolerance, ops::FloatElem};
    use std::io::Write;

    type FT = FloatElem<TestBackend>;

    fn prior_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_one_value_per_line() {
        let file = prior_file("-0.5\n\n-1.5\n  -2.0  \n");

        let values = load_log_prior(file.path(), 3).unwrap();

        assert_eq!(values, vec![-0.5, -1.5, -2.0]);
    }

    #[test]
    fn class_count_must_match() {
        let file = prior_file("-0.5\n-1.5\n");

        let result = load_log_prior(file.path(), 3);

        assert!(matches!(
            result,
            Err(LossError::PriorDimMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn unparsable_line_is_a_file_error() {
        let file = prior_file("-0.5\nabc\n");

        assert!(matches!(
            load_log_prior(file.path(), 2),
            Err(LossError::PriorFile { .. })
        ));
    }

    #[test]
    fn cumulative_average_of_estimates() {
        let device = Default::default();
        let mut prior = RunningPrior::<TestBackend>::uniform(2, 0.0, &device);

        prior.update(Tensor::from_floats([1.0, 0.0], &device));
        prior.update(Tensor::from_floats([0.0, 1.0], &device));
        prior.update(Tensor::from_floats([0.5, 0.5], &device));

        assert_eq!(prior.updates(), 3);
        prior
            .priors()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.5, 0.5]), Tolerance::default());
    }

    #[test]
    fn exponential_average_moves_towards_estimate() {
        let device = Default::default();
        let mut prior = RunningPrior::<TestBackend>::zeros(2, 0.25, &device);

        prior.update(Tensor::from_floats([1.0, 0.0], &device));

        prior
            .priors()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.25, 0.0]), Tolerance::default());
    }

    #[test]
    fn compute_priors_overrides_the_prior_file() {
        let device = Default::default();
        let file = prior_file("-0.1\n-2.0\n");
        let config = OutputLayerConfig::new(2, LossName::FastBw)
            .with_log_prior(Some(file.path().display().to_string()))
            .with_compute_priors(true);

        let prior = Prior::<TestBackend>::from_config(&config, &device)
            .unwrap()
            .unwrap();

        assert!(matches!(prior, Prior::Running(_)));
        prior
            .priors()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.5, 0.5]), Tolerance::default());
    }

    #[test]
    fn trained_prior_starts_from_the_file() {
        let device = Default::default();
        let file = prior_file(&format!("{}\n{}\n", 0.25f32.ln(), 0.75f32.ln()));
        let config = OutputLayerConfig::new(2, LossName::FastBw)
            .with_log_prior(Some(file.path().display().to_string()))
            .with_trained_softmax_prior(true);

        let prior = Prior::<TestBackend>::from_config(&config, &device)
            .unwrap()
            .unwrap();

        assert!(prior.trainable_logits().is_some());
        prior
            .priors()
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.25, 0.75]), Tolerance::default());
    }
}
