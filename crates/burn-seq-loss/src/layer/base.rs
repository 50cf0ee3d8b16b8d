use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::Initializer;
use burn::tensor::{Bool, Int, Tensor, activation, backend::Backend};

use crate::data::{int_values, scalar};
use crate::functional::{argmax_rows, flatten_time_batch, masked_row_mean, mismatches};
use crate::{
    FlatTarget, GradTargets, LogitsGradPolicy, LossError, LossName, OutputLayerConfig, Target,
    TimeLimit,
};

/// Whether the network is trained or evaluated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// Training step.
    #[default]
    Train,
    /// Evaluation or decoding.
    Eval,
}

/// Activation of a source layer, time major.
#[derive(Debug, Clone)]
pub enum SourceActivation<B: Backend> {
    /// `[time, batch, n_in]`.
    Dense(Tensor<B, 3>),
    /// `[streams, time, batch, n_in]`, summed over the streams.
    Stacked(Tensor<B, 4>),
    /// Class indices `[time, batch]`, looked up as rows of the weight matrix.
    Sparse(Tensor<B, 2, Int>),
}

impl<B: Backend> SourceActivation<B> {
    fn time_batch(&self) -> [usize; 2] {
        match self {
            Self::Dense(x) => {
                let [time, batch, _] = x.dims();
                [time, batch]
            }
            Self::Stacked(x) => {
                let [_, time, batch, _] = x.dims();
                [time, batch]
            }
            Self::Sparse(x) => x.dims(),
        }
    }
}

/// A source layer feeding an output layer.
#[derive(Debug, Clone)]
pub struct Source<B: Backend> {
    /// The activation.
    pub activation: SourceActivation<B>,
    /// Valid frames, `[time, batch]`.
    pub index: Tensor<B, 2, Bool>,
    /// Feature dropout mask, `[n_in]`.
    pub dropout_mask: Option<Tensor<B, 1>>,
    /// Number of output frames per sequence, when the source reports it.
    pub output_sizes: Option<Vec<usize>>,
}

impl<B: Backend> Source<B> {
    /// A source without dropout mask or output sizes.
    pub fn new(activation: SourceActivation<B>, index: Tensor<B, 2, Bool>) -> Self {
        Self {
            activation,
            index,
            dropout_mask: None,
            output_sizes: None,
        }
    }

    /// Set the feature dropout mask.
    pub fn with_dropout_mask(mut self, mask: Tensor<B, 1>) -> Self {
        self.dropout_mask = Some(mask);
        self
    }

    /// Set the output sizes.
    pub fn with_output_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.output_sizes = Some(sizes);
        self
    }
}

/// Inputs of an output layer for one batch.
#[derive(Debug, Clone)]
pub struct OutputInput<B: Backend> {
    /// Source layers, at least one.
    pub sources: Vec<Source<B>>,
    /// The target.
    pub target: Target<B>,
    /// Valid target frames, `[time, batch]`. Defaults to the index of the first source.
    pub target_index: Option<Tensor<B, 2, Bool>>,
    /// Train or eval.
    pub phase: Phase,
}

impl<B: Backend> OutputInput<B> {
    /// Training inputs without target index.
    pub fn new(sources: Vec<Source<B>>, target: Target<B>) -> Self {
        Self {
            sources,
            target,
            target_index: None,
            phase: Phase::Train,
        }
    }

    /// Set the target index.
    pub fn with_target_index(mut self, index: Tensor<B, 2, Bool>) -> Self {
        self.target_index = Some(index);
        self
    }

    /// Set the phase.
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }
}

/// Configuration to create an [output projection](OutputProjection).
#[derive(Config, Debug)]
pub struct OutputProjectionConfig {
    /// Feature size of each source.
    pub n_inputs: Vec<usize>,
    /// Number of output classes.
    pub n_out: usize,
    /// Initializer of the weights.
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    pub initializer: Initializer,
}

impl OutputProjectionConfig {
    /// Initialize a new [output projection](OutputProjection).
    ///
    /// The bias starts at `log(1 / n_out)`, so the initial scores are log-uniform.
    pub fn init<B: Backend>(&self, device: &B::Device) -> OutputProjection<B> {
        let weights = self
            .n_inputs
            .iter()
            .map(|n_in| {
                self.initializer
                    .init_with([*n_in, self.n_out], Some(*n_in), Some(self.n_out), device)
            })
            .collect();
        let bias = Tensor::full([self.n_out], -(self.n_out as f32).ln(), device);

        OutputProjection {
            weights,
            bias: Param::from_tensor(bias),
        }
    }
}

/// Affine map of the sources to the output scores, `z = b + sum_i x_i W_i`.
#[derive(Module, Debug)]
pub struct OutputProjection<B: Backend> {
    /// One weight matrix `[n_in, n_out]` per source.
    pub weights: Vec<Param<Tensor<B, 2>>>,
    /// Bias `[n_out]`.
    pub bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> OutputProjection<B> {
    /// Project the sources.
    ///
    /// Dropout masks are applied as `mass * mask * x`.
    ///
    /// # Shapes
    ///
    /// - sources: `[time, batch, n_in_i]`, see [SourceActivation]
    /// - output: `[time, batch, n_out]`
    pub fn forward(&self, sources: &[Source<B>], mass: f32) -> Result<Tensor<B, 3>, LossError> {
        if sources.len() != self.weights.len() {
            return Err(LossError::ShapeMismatch(format!(
                "{} sources for {} weight matrices",
                sources.len(),
                self.weights.len()
            )));
        }
        let Some(first) = sources.first() else {
            return Err(LossError::InvalidConfig(
                "an output layer needs at least one source".into(),
            ));
        };
        let [time, batch] = first.activation.time_batch();
        let [n_out] = self.bias.val().dims();

        let mut z = self.bias.val().reshape([1, n_out]);
        for (i, (source, weight)) in sources.iter().zip(&self.weights).enumerate() {
            if source.activation.time_batch() != [time, batch] {
                return Err(LossError::ShapeMismatch(format!(
                    "source {i} spans {:?}, the first source spans {:?}",
                    source.activation.time_batch(),
                    [time, batch]
                )));
            }
            let weight = weight.val();
            let [n_in, _] = weight.dims();
            let projected = match &source.activation {
                SourceActivation::Sparse(classes) => {
                    if int_values(classes.clone())
                        .iter()
                        .any(|class| *class < 0 || *class as usize >= n_in)
                    {
                        return Err(LossError::ShapeMismatch(format!(
                            "sparse source {i} has classes outside of [0, {n_in})"
                        )));
                    }
                    weight.select(0, classes.clone().reshape([time * batch]))
                }
                SourceActivation::Dense(x) => {
                    dense_rows(x.clone(), source, i, n_in, mass)?.matmul(weight)
                }
                SourceActivation::Stacked(x) => {
                    let [_, t, b, features] = x.dims();
                    let x = x.clone().sum_dim(0).reshape([t, b, features]);
                    dense_rows(x, source, i, n_in, mass)?.matmul(weight)
                }
            };
            z = z.add(projected);
        }

        Ok(z.reshape([time, batch, n_out]))
    }
}

fn dense_rows<B: Backend>(
    x: Tensor<B, 3>,
    source: &Source<B>,
    i: usize,
    n_in: usize,
    mass: f32,
) -> Result<Tensor<B, 2>, LossError> {
    let [time, batch, features] = x.dims();
    if features != n_in {
        return Err(LossError::ShapeMismatch(format!(
            "source {i} has {features} features, its weight matrix expects {n_in}"
        )));
    }
    let x = match &source.dropout_mask {
        Some(mask) => x
            .mul(mask.clone().reshape([1, 1, features]))
            .mul_scalar(mass),
        None => x,
    };

    Ok(x.reshape([time * batch, features]))
}

/// Repeat the last frame of `[time, batch, dim]` until it spans `target` frames.
pub(crate) fn pad_last_frame<B: Backend>(x: Tensor<B, 3>, target: usize) -> Tensor<B, 3> {
    let [time, batch, dim] = x.dims();
    if time >= target || time == 0 {
        return x;
    }
    let last = x
        .clone()
        .slice([time - 1..time, 0..batch, 0..dim])
        .repeat_dim(0, target - time);

    Tensor::cat(vec![x, last], 0)
}

fn pad_index<B: Backend>(index: Tensor<B, 2>, target: usize, value: f32) -> Tensor<B, 2> {
    let [time, batch] = index.dims();
    if time >= target {
        return index;
    }
    let padding = Tensor::full([target - time, batch], value, &index.device());

    Tensor::cat(vec![index, padding], 0)
}

/// Scores, masks and target of an output layer after the shared preprocessing.
///
/// Building it checks the sources, then applies in order the time limit, the length
/// reconciliation of scores, index and target, the softmax smoothing and the conversion of
/// probability inputs to log space.
///
/// With a gradient policy, losses see a detached copy of the scores, so that the gradient
/// reaching the sources can be rewritten before it flows further, see
/// [Cost::backward](crate::Cost::backward).
#[derive(Debug, Clone)]
pub struct OutputBase<B: Backend> {
    pub(crate) loss: LossName,
    pub(crate) normalize_length: bool,
    pub(crate) policy: LogitsGradPolicy,
    pub(crate) phase: Phase,
    pub(crate) z: Tensor<B, 3>,
    pub(crate) source_z: Tensor<B, 3>,
    pub(crate) raw: Option<Tensor<B, 3>>,
    pub(crate) index: Tensor<B, 2>,
    pub(crate) source_index: Tensor<B, 2>,
    pub(crate) target: Target<B>,
    pub(crate) target_index: Option<Tensor<B, 2, Bool>>,
    pub(crate) flat_target: FlatTarget<B>,
    pub(crate) norm: f32,
    pub(crate) output_sizes: Option<Vec<usize>>,
}

impl<B: Backend> OutputBase<B> {
    /// Preprocess frame aligned targets.
    pub fn new(
        config: &OutputLayerConfig,
        z: Tensor<B, 3>,
        input: OutputInput<B>,
    ) -> Result<Self, LossError> {
        Self::build(config, z, input, true)
    }

    /// Preprocess label sequence targets, which keep their own length. The frame index is the
    /// source index.
    pub fn with_label_sequence(
        config: &OutputLayerConfig,
        z: Tensor<B, 3>,
        input: OutputInput<B>,
    ) -> Result<Self, LossError> {
        Self::build(config, z, input, false)
    }

    fn build(
        config: &OutputLayerConfig,
        z: Tensor<B, 3>,
        input: OutputInput<B>,
        frame_aligned: bool,
    ) -> Result<Self, LossError> {
        let OutputInput {
            sources,
            target,
            target_index,
            phase,
        } = input;
        let Some(first) = sources.first() else {
            return Err(LossError::InvalidConfig(
                "an output layer needs at least one source".into(),
            ));
        };
        let [time, batch] = first.activation.time_batch();
        for (i, source) in sources.iter().enumerate() {
            let dims = source.activation.time_batch();
            if dims != [time, batch] || source.index.dims() != [time, batch] {
                return Err(LossError::ShapeMismatch(format!(
                    "source {i} spans {dims:?} with index {:?}, the first source spans {:?}",
                    source.index.dims(),
                    [time, batch]
                )));
            }
        }
        let [z_time, z_batch, classes] = z.dims();
        if z_batch != batch || classes != config.n_out {
            return Err(LossError::ShapeMismatch(format!(
                "scores of shape {:?} for a batch of {batch} and {} classes",
                z.dims(),
                config.n_out
            )));
        }
        if let Some(target_time) = target.time() {
            let target_batch = match &target {
                Target::Labels(labels) => labels.dims()[1],
                Target::OneHot(one_hot) => one_hot.dims()[1],
                Target::Dense(dense) => dense.dims()[1],
                _ => batch,
            };
            if target_batch != batch {
                return Err(LossError::ShapeMismatch(format!(
                    "target of {target_time} frames and {target_batch} sequences for a batch \
                     of {batch}"
                )));
            }
        }

        let output_sizes = sources.iter().find_map(|source| source.output_sizes.clone());
        let source_index = first.index.clone().float();
        let policy = LogitsGradPolicy {
            clip: config.grad_clip_z,
            discard_out_of_bound: config.grad_discard_out_of_bound_z,
        };

        let mut base = Self {
            loss: config.loss,
            normalize_length: config.normalize_length,
            policy,
            phase,
            source_z: z.clone(),
            z,
            raw: None,
            index: source_index.clone(),
            source_index,
            target,
            target_index,
            flat_target: FlatTarget::None,
            norm: 1.0,
            output_sizes,
        };

        if frame_aligned {
            if !config.use_source_index {
                if let Some(index) = &base.target_index {
                    base.index = index.clone().float();
                }
            }
            base.apply_time_limit(config.time_limit, z_time);
            base.reconcile_lengths();
            let [time, batch, classes] = base.z.dims();
            base.flat_target = base.target.flatten(time, batch, classes);
        }

        if config.softmax_smoothing != 1.0 {
            log::info!("Scaling the output scores by {}", config.softmax_smoothing);
            base.z = base.z.mul_scalar(config.softmax_smoothing);
        }
        if !config.apply_softmax {
            base.raw = Some(base.z.clone());
            base.z = base.z.clamp(1e-38, 1e20).log();
        }
        base.source_z = base.z.clone();
        if !policy.is_identity() {
            base.z = base.z.detach().require_grad();
        }

        Ok(base)
    }

    fn apply_time_limit(&mut self, time_limit: TimeLimit, z_time: usize) {
        match time_limit {
            TimeLimit::Off => {}
            TimeLimit::Frames(limit) => {
                let [index_time, batch] = self.index.dims();
                let end = limit.min(z_time).min(index_time);
                if end >= index_time && end >= z_time {
                    return;
                }
                let before = scalar(self.index.clone().sum());
                self.index = pad_index(
                    self.index.clone().slice([0..end, 0..batch]),
                    index_time,
                    0.0,
                );
                let [_, _, classes] = self.z.dims();
                if end < z_time {
                    self.z = self.z.clone().slice_assign(
                        [end..z_time, 0..batch, 0..classes],
                        Tensor::zeros([z_time - end, batch, classes], &self.z.device()),
                    );
                }
                let after = scalar(self.index.clone().sum());
                self.norm *= before / after.max(1.0);
                log::info!(
                    "Time limit of {limit} frames keeps {after} of {before} frames, norm {}",
                    self.norm
                );
            }
            TimeLimit::Inf => {
                if self.phase == Phase::Eval {
                    let before = scalar(self.index.clone().sum());
                    self.index = self.source_index.clone();
                    let after = scalar(self.index.clone().sum());
                    self.norm *= before / after.max(1.0);
                }
            }
        }
    }

    /// Pad scores, index and target to a common number of frames.
    ///
    /// Scores repeat their last frame, the index is extended with valid frames and the target
    /// with zeros. Extending the index rescales the normalization.
    fn reconcile_lengths(&mut self) {
        let [z_time, _, _] = self.z.dims();
        let [index_time, _] = self.index.dims();
        let time = z_time
            .max(index_time)
            .max(self.target.time().unwrap_or(0));

        if z_time < time {
            log::debug!("Padding the scores from {z_time} to {time} frames");
            self.z = pad_last_frame(self.z.clone(), time);
        }
        if index_time < time {
            let before = scalar(self.index.clone().sum());
            self.index = pad_index(self.index.clone(), time, 1.0);
            let after = scalar(self.index.clone().sum());
            self.norm *= before / after.max(1.0);
            log::debug!("Padding the index from {index_time} to {time} frames");
        }
        self.source_index = pad_index(self.source_index.clone(), time, 0.0);
        self.target = core::mem::replace(&mut self.target, Target::None).pad_time(time);
    }

    /// Training criterion.
    pub fn loss(&self) -> LossName {
        self.loss
    }

    /// Train or eval.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Policy applied to the gradients of the scores.
    pub fn policy(&self) -> LogitsGradPolicy {
        self.policy
    }

    /// Scores `[time, batch, classes]`, in log space when the input held probabilities.
    pub fn z(&self) -> Tensor<B, 3> {
        self.z.clone()
    }

    /// Scores as they came from the sources, connected to the graph even when a gradient policy
    /// detaches [z](Self::z).
    pub fn source_z(&self) -> Tensor<B, 3> {
        self.source_z.clone()
    }

    /// Tensors receiving the gradients of a cost computed on these scores.
    pub fn grad_targets(
        &self,
        probabilities: Option<Tensor<B, 2>>,
        softmax_prior: Option<Tensor<B, 1>>,
    ) -> GradTargets<B> {
        GradTargets {
            logits: self.source_z(),
            detached_logits: (!self.policy.is_identity()).then(|| self.z()),
            probabilities,
            softmax_prior,
        }
    }

    /// Scores flattened to `[time * batch, classes]`.
    pub fn flat_z(&self) -> Tensor<B, 2> {
        flatten_time_batch(self.z.clone())
    }

    /// The probabilities given as input, `[time, batch, classes]`, when `apply_softmax` is off.
    pub fn raw_probabilities(&self) -> Option<Tensor<B, 3>> {
        self.raw.clone()
    }

    /// Valid frames `[time, batch]`, `1` or `0`.
    pub fn index(&self) -> Tensor<B, 2> {
        self.index.clone()
    }

    /// Valid frames flattened to `[time * batch]`.
    pub fn flat_index(&self) -> Tensor<B, 1> {
        let [time, batch] = self.index.dims();
        self.index.clone().reshape([time * batch])
    }

    /// Valid frames of the first source `[time, batch]`, `1` or `0`.
    pub fn source_index(&self) -> Tensor<B, 2> {
        self.source_index.clone()
    }

    /// Valid source frames flattened to `[time * batch]`.
    pub fn flat_source_index(&self) -> Tensor<B, 1> {
        let [time, batch] = self.source_index.dims();
        self.source_index.clone().reshape([time * batch])
    }

    /// The target, padded to the scores for frame aligned targets.
    pub fn target(&self) -> &Target<B> {
        &self.target
    }

    /// The valid target positions, as given.
    pub fn target_index(&self) -> Option<Tensor<B, 2, Bool>> {
        self.target_index.clone()
    }

    /// The target flattened to rows of the flat scores.
    pub fn flat_target(&self) -> &FlatTarget<B> {
        &self.flat_target
    }

    /// Normalization factor of the loss and the errors.
    pub fn norm(&self) -> f32 {
        self.norm
    }

    /// Output frames per sequence reported by a source.
    pub fn output_sizes(&self) -> Option<&[usize]> {
        self.output_sizes.as_deref()
    }

    /// Frame errors of the predictions `[time * batch, classes]` against the target.
    ///
    /// Label targets count mismatching valid frames scaled by the norm, or mismatching
    /// sequences with `normalize_length`. Dense targets give the mean squared error over valid
    /// frames. Without target there is nothing to count.
    pub fn errors(&self, predictions: Tensor<B, 2>) -> Result<Option<Tensor<B, 1>>, LossError> {
        let mask = self.flat_index();
        match &self.flat_target {
            FlatTarget::None => Ok(None),
            FlatTarget::Dense(target) => {
                if target.dims() != predictions.dims() {
                    return Err(LossError::ShapeMismatch(format!(
                        "dense target {:?} for predictions {:?}",
                        target.dims(),
                        predictions.dims()
                    )));
                }
                let [rows, _] = target.dims();
                let squared = predictions.sub(target.clone()).powf_scalar(2.0).mean_dim(1);
                Ok(Some(masked_row_mean(squared.reshape([rows, 1]), mask)))
            }
            flat => {
                let Some(labels) = flat.labels() else {
                    return Ok(None);
                };
                let predicted = argmax_rows(predictions);
                if self.normalize_length {
                    let [time, batch] = self.index.dims();
                    let wrong = predicted
                        .equal(labels)
                        .bool_not()
                        .float()
                        .mul(mask)
                        .reshape([time, batch]);
                    Ok(Some(wrong.max_dim(0).sum().mul_scalar(self.norm)))
                } else {
                    Ok(Some(
                        mismatches(predicted, labels, mask).mul_scalar(self.norm),
                    ))
                }
            }
        }
    }

    /// Entropy of the probability rows `[time * batch, classes]` summed over valid frames.
    pub fn entropy(&self, probabilities: Tensor<B, 2>) -> Tensor<B, 1> {
        let [rows, _] = probabilities.dims();
        probabilities
            .clone()
            .mul(probabilities.clamp(1e-38, 1e20).log())
            .sum_dim(1)
            .reshape([rows])
            .mul(self.flat_index())
            .sum()
            .neg()
    }

    /// Softmax of the flat scores, or the input probabilities when `apply_softmax` is off.
    pub fn flat_probabilities(&self) -> Tensor<B, 2> {
        match &self.raw {
            Some(raw) => flatten_time_batch(raw.clone()),
            None => activation::softmax(self.flat_z(), 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{TensorData, Tolerance, ops::FloatElem};

    type FT = FloatElem<TestBackend>;

    fn source(time: usize, mask: &[bool]) -> Source<TestBackend> {
        let device = Default::default();
        Source::new(
            SourceActivation::Dense(Tensor::zeros([time, 1, 2], &device)),
            Tensor::from_data(TensorData::new(mask.to_vec(), [time, 1]), &device),
        )
    }

    fn scores(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 3> {
        Tensor::from_floats([[[2.0, 0.0]], [[0.0, 2.0]], [[0.0, 0.0]]], device)
    }

    #[test]
    fn projection_adds_every_source() {
        let device = Default::default();
        let projection = OutputProjection::<TestBackend> {
            weights: vec![
                Param::from_tensor(Tensor::from_floats([[1.0, 0.0], [0.0, 1.0]], &device)),
                Param::from_tensor(Tensor::from_floats(
                    [[0.5, 0.5], [1.0, -1.0], [0.0, 2.0]],
                    &device,
                )),
            ],
            bias: Param::from_tensor(Tensor::from_floats([0.1, 0.2], &device)),
        };
        let index = Tensor::<TestBackend, 2, Bool>::from_data(TensorData::from([[true]]), &device);
        let sources = vec![
            Source::new(
                SourceActivation::Dense(Tensor::from_floats([[[1.0, 2.0]]], &device)),
                index.clone(),
            ),
            Source::new(
                SourceActivation::Sparse(Tensor::from_ints([[2]], &device)),
                index,
            ),
        ];

        let z = projection.forward(&sources, 1.0).unwrap();

        z.into_data()
            .assert_approx_eq::<FT>(&TensorData::from([[[1.1, 4.2]]]), Tolerance::default());
    }

    #[test]
    fn projection_needs_one_weight_per_source() {
        let device = Default::default();
        let projection = OutputProjectionConfig::new(vec![2, 2], 3).init::<TestBackend>(&device);

        let result = projection.forward(&[source(1, &[true])], 1.0);

        assert!(matches!(result, Err(LossError::ShapeMismatch(_))));
    }

    #[test]
    fn frame_time_limit_rescales_the_norm() {
        let device = Default::default();
        let config =
            OutputLayerConfig::new(2, LossName::Ce).with_time_limit(TimeLimit::Frames(1));
        let input = OutputInput::new(vec![source(3, &[true, true, false])], Target::None);

        let base = OutputBase::new(&config, scores(&device), input).unwrap();

        assert_eq!(base.norm(), 2.0);
        base.index()
            .into_data()
            .assert_eq(&TensorData::from([[1.0], [0.0], [0.0]]), false);
        base.z()
            .into_data()
            .assert_eq(&TensorData::from([[[2.0, 0.0]], [[0.0, 0.0]], [[0.0, 0.0]]]), false);
    }

    #[test]
    fn longer_target_pads_scores_with_their_last_frame() {
        let device = Default::default();
        let config = OutputLayerConfig::new(2, LossName::Ce).with_time_limit(TimeLimit::Inf);
        let target = Tensor::<TestBackend, 2, Int>::from_ints([[0], [1], [1], [0]], &device);
        let target_index = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::from([[true], [true], [true], [true]]),
            &device,
        );
        let input = OutputInput::new(vec![source(3, &[true, true, true])], Target::Labels(target))
            .with_target_index(target_index);

        let base = OutputBase::new(&config, scores(&device), input).unwrap();

        assert_eq!(base.z().dims(), [4, 1, 2]);
        base.z()
            .slice([3..4, 0..1, 0..2])
            .into_data()
            .assert_eq(&TensorData::from([[[0.0, 0.0]]]), false);
        assert_eq!(base.norm(), 1.0);
    }

    #[test]
    fn shorter_index_is_extended_with_valid_frames() {
        let device = Default::default();
        let config = OutputLayerConfig::new(2, LossName::Ce);
        let target_index =
            Tensor::<TestBackend, 2, Bool>::from_data(TensorData::from([[true], [false]]), &device);
        let input = OutputInput::new(vec![source(3, &[true, true, true])], Target::None)
            .with_target_index(target_index);

        let base = OutputBase::new(&config, scores(&device), input).unwrap();

        base.index()
            .into_data()
            .assert_eq(&TensorData::from([[1.0], [0.0], [1.0]]), false);
        assert_eq!(base.norm(), 0.5);
    }

    #[test]
    fn errors_count_mismatching_valid_frames() {
        let device = Default::default();
        let config = OutputLayerConfig::new(2, LossName::Ce);
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[1], [1], [0]], &device);
        let input = OutputInput::new(vec![source(3, &[true, true, false])], Target::Labels(labels));

        let base = OutputBase::new(&config, scores(&device), input).unwrap();
        let errors = base.errors(base.flat_z()).unwrap().unwrap();

        errors.into_data().assert_eq(&TensorData::from([1.0]), false);
    }

    #[test]
    fn infinite_time_limit_in_evaluation_rescales_to_the_source_index() {
        let device = Default::default();
        let config = OutputLayerConfig::new(2, LossName::Ce).with_time_limit(TimeLimit::Inf);
        let target_index =
            Tensor::<TestBackend, 2, Bool>::from_data(TensorData::from([[true], [false]]), &device);
        let input = OutputInput::new(vec![source(2, &[true, true])], Target::None)
            .with_target_index(target_index)
            .with_phase(Phase::Eval);
        let z = Tensor::from_floats([[[2.0, 0.0]], [[0.0, 2.0]]], &device);

        let base = OutputBase::new(&config, z, input).unwrap();

        base.index()
            .into_data()
            .assert_eq(&TensorData::from([[1.0], [1.0]]), false);
        assert_eq!(base.norm(), 0.5);
    }

    #[test]
    fn sequence_errors_are_normalized() {
        let device = Default::default();
        let config = OutputLayerConfig::new(2, LossName::Ce)
            .with_normalize_length(true)
            .with_time_limit(TimeLimit::Frames(1));
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[1], [1], [0]], &device);
        let input = OutputInput::new(vec![source(3, &[true, true, false])], Target::Labels(labels));

        let base = OutputBase::new(&config, scores(&device), input).unwrap();
        let errors = base.errors(base.flat_z()).unwrap().unwrap();

        assert_eq!(base.norm(), 2.0);
        errors.into_data().assert_eq(&TensorData::from([2.0]), false);
    }

    #[test]
    fn scores_must_match_the_class_count() {
        let device = Default::default();
        let config = OutputLayerConfig::new(3, LossName::Ce);
        let input = OutputInput::new(vec![source(3, &[true, true, true])], Target::None);

        let result = OutputBase::new(&config, scores(&device), input);

        assert!(matches!(result, Err(LossError::ShapeMismatch(_))));
    }
}
