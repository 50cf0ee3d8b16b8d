use burn::tensor::{Int, Tensor, activation, backend::Backend};
use burn_loop::{Dim, ReduceAxis, reduce_logsumexp};
use derive_new::new;

use super::{OutputBase, OutputInput, OutputProjection, OutputProjectionConfig, Phase};
use crate::data::{int_tensor, int_values, lengths};
use crate::functional::{
    argmax_rows, flatten_time_batch, masked_nll, masked_row_mean, mismatches, one_hot,
};
use crate::ops::{Operators, collapse_frame_labels, ctc_log_likelihood};
use crate::{
    Cost, GradTargets, KnownGrads, LossError, LossName, OutputLayerConfig, Prior, SprintOptions,
};

/// Sequence training criterion, with the options each one uses.
#[derive(Clone, Debug, PartialEq)]
pub enum SequenceCriterion {
    /// CTC through the [CTC operator](crate::ops::CtcOp).
    Ctc,
    /// Framewise cross-entropy against frame aligned labels.
    CeCtc,
    /// CTC built from tensor operations, see [ctc_log_likelihood].
    Ctc2,
    /// Loss and error signal of the external [scorer](crate::ops::SequenceScorer).
    Sprint {
        /// Options of the scorer.
        options: SprintOptions,
        /// Score log posteriors instead of the raw logits.
        exp_normalize: bool,
        /// Scale of the log prior subtracted from the scores.
        prior_scale: f32,
        /// Report a cross-entropy against the soft targets implied by the error signal.
        loss_like_ce: bool,
        /// Weight of the framewise cross-entropy.
        ce_smoothing: f32,
    },
    /// Expected score under a Baum-Welch soft alignment.
    FastBw {
        /// Options of the automata source.
        options: SprintOptions,
        /// Scale of the acoustic scores.
        am_scale: f32,
        /// Scale of the log prior added to the acoustic scores.
        prior_scale: f32,
        /// Exponent applied to the soft alignment.
        gamma: f32,
        /// Divide the soft alignment by its class average.
        bw_norm_class_avg: bool,
        /// Weight of the sibling alignment.
        ce_smoothing: f32,
        /// Layer providing the sibling alignment.
        ce_target_layer_align: Option<String>,
    },
    /// Cross-entropy against a forced alignment.
    Viterbi {
        /// Scale of the log prior subtracted from the alignment scores.
        prior_scale: f32,
    },
}

impl SequenceCriterion {
    /// Validate the configuration and select the criterion.
    pub fn from_config(config: &OutputLayerConfig) -> Result<Self, LossError> {
        config.validate()?;
        let criterion = match config.loss {
            LossName::Ctc => Self::Ctc,
            LossName::CeCtc => Self::CeCtc,
            LossName::Ctc2 => Self::Ctc2,
            LossName::Sprint => Self::Sprint {
                options: config.sprint_options("sprint")?,
                exp_normalize: config.exp_normalize,
                prior_scale: config.prior_scale,
                loss_like_ce: config.loss_like_ce,
                ce_smoothing: config.ce_smoothing,
            },
            LossName::FastBw => {
                if config.ce_smoothing > 0.0 && config.ce_target_layer_align.is_none() {
                    return Err(LossError::MissingOption {
                        loss: "fast_bw",
                        option: "ce_target_layer_align",
                    });
                }
                Self::FastBw {
                    options: config.sprint_options("fast_bw")?,
                    am_scale: config.am_scale,
                    prior_scale: config.prior_scale,
                    gamma: config.gamma,
                    bw_norm_class_avg: config.bw_norm_class_avg,
                    ce_smoothing: config.ce_smoothing,
                    ce_target_layer_align: config.ce_target_layer_align.clone(),
                }
            }
            LossName::Viterbi => Self::Viterbi {
                prior_scale: config.prior_scale,
            },
            other => {
                return Err(LossError::InvalidLoss {
                    layer: "sequence",
                    loss: other.to_string(),
                });
            }
        };
        if !config.apply_softmax {
            return Err(LossError::NotImplemented(format!(
                "the {} loss on probability inputs",
                config.loss
            )));
        }
        let has_prior =
            config.log_prior.is_some() || config.compute_priors || config.trained_softmax_prior;
        if criterion.prior_scale() != 0.0 && !has_prior {
            return Err(LossError::MissingOption {
                loss: criterion.name(),
                option: "log_prior",
            });
        }

        Ok(criterion)
    }

    fn prior_scale(&self) -> f32 {
        match self {
            Self::Sprint { prior_scale, .. }
            | Self::FastBw { prior_scale, .. }
            | Self::Viterbi { prior_scale } => *prior_scale,
            Self::Ctc | Self::CeCtc | Self::Ctc2 => 0.0,
        }
    }

    /// Name of the criterion.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ctc => "ctc",
            Self::CeCtc => "ce_ctc",
            Self::Ctc2 => "ctc2",
            Self::Sprint { .. } => "sprint",
            Self::FastBw { .. } => "fast_bw",
            Self::Viterbi { .. } => "viterbi",
        }
    }

    /// Whether the target is a label sequence rather than one label per frame.
    pub fn uses_label_sequences(&self) -> bool {
        matches!(self, Self::Ctc | Self::Viterbi { .. })
    }
}

impl OutputLayerConfig {
    /// Initialize a [sequence output layer](SequenceOutputLayer) fed by sources of the given
    /// feature sizes.
    pub fn init_sequence<B: Backend>(
        &self,
        n_inputs: &[usize],
        operators: Operators<B>,
        device: &B::Device,
    ) -> Result<SequenceOutputLayer<B>, LossError> {
        let criterion = SequenceCriterion::from_config(self)?;
        let projection = OutputProjectionConfig::new(n_inputs.to_vec(), self.n_out)
            .with_initializer(self.initializer.clone())
            .init(device);
        let prior = Prior::from_config(self, device)?;
        log::info!(
            "Sequence output layer with the {} loss and {} classes",
            criterion.name(),
            self.n_out
        );

        Ok(SequenceOutputLayer {
            config: self.clone(),
            criterion,
            projection,
            prior,
            operators,
        })
    }
}

/// Per batch information a sequence criterion may need besides its inputs.
#[derive(Debug, Clone, new)]
pub struct SequenceContext<B: Backend> {
    /// Sequence tags, in batch order.
    #[new(default)]
    pub tags: Vec<String>,
    /// Soft alignment of the layer named by `ce_target_layer_align`, `[time, batch, classes]`.
    #[new(default)]
    pub sibling_alignment: Option<Tensor<B, 3>>,
}

impl<B: Backend> SequenceContext<B> {
    /// Set the sequence tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the sibling alignment.
    pub fn with_sibling_alignment(mut self, alignment: Tensor<B, 3>) -> Self {
        self.sibling_alignment = Some(alignment);
        self
    }
}

/// Output layer trained with a sequence criterion.
#[derive(Debug)]
pub struct SequenceOutputLayer<B: Backend> {
    config: OutputLayerConfig,
    criterion: SequenceCriterion,
    /// Maps the sources to the scores.
    pub projection: OutputProjection<B>,
    prior: Option<Prior<B>>,
    operators: Operators<B>,
}

impl<B: Backend> SequenceOutputLayer<B> {
    /// The configuration.
    pub fn config(&self) -> &OutputLayerConfig {
        &self.config
    }

    /// The criterion.
    pub fn criterion(&self) -> &SequenceCriterion {
        &self.criterion
    }

    /// The class prior, if one is configured.
    pub fn prior(&self) -> Option<&Prior<B>> {
        self.prior.as_ref()
    }

    /// Project the sources and compute the loss.
    pub fn forward(
        &self,
        input: OutputInput<B>,
        context: &SequenceContext<B>,
    ) -> Result<SequenceOutput<B>, LossError> {
        let z = self.projection.forward(&input.sources, self.config.mass)?;
        self.forward_logits(z, input, context)
    }

    /// Compute the loss of given scores `[time, batch, n_out]`.
    pub fn forward_logits(
        &self,
        z: Tensor<B, 3>,
        input: OutputInput<B>,
        context: &SequenceContext<B>,
    ) -> Result<SequenceOutput<B>, LossError> {
        let base = if self.criterion.uses_label_sequences() {
            OutputBase::with_label_sequence(&self.config, z, input)?
        } else {
            OutputBase::new(&self.config, z, input)?
        };
        let [_, batch, _] = base.z().dims();
        let lengths = match base.output_sizes() {
            Some(sizes) if sizes.len() != batch => {
                return Err(LossError::ShapeMismatch(format!(
                    "{} output sizes for a batch of {batch}",
                    sizes.len()
                )));
            }
            Some(sizes) => sizes.to_vec(),
            None => lengths(base.source_index()),
        };
        let probabilities = activation::softmax(base.z(), 2);

        let (cost, alignment) = match &self.criterion {
            SequenceCriterion::Ctc => (self.ctc(&base, probabilities.clone(), &lengths)?, None),
            SequenceCriterion::CeCtc => (self.ce_ctc(&base)?, None),
            SequenceCriterion::Ctc2 => (self.ctc2(&base, &lengths)?, None),
            SequenceCriterion::Sprint {
                options,
                exp_normalize,
                prior_scale,
                loss_like_ce,
                ce_smoothing,
            } => {
                let cost = self.sprint(
                    &base,
                    probabilities.clone(),
                    &lengths,
                    context,
                    SprintSettings {
                        options,
                        exp_normalize: *exp_normalize,
                        prior_scale: *prior_scale,
                        loss_like_ce: *loss_like_ce,
                        ce_smoothing: *ce_smoothing,
                    },
                )?;
                (cost, None)
            }
            SequenceCriterion::FastBw { .. } => {
                (self.fast_bw(&base, probabilities.clone(), context)?, None)
            }
            SequenceCriterion::Viterbi { prior_scale } => {
                let (cost, alignment) = self.viterbi(&base, &lengths, *prior_scale)?;
                (cost, Some(alignment))
            }
        };

        let prior_update = match (&self.prior, base.phase()) {
            (Some(Prior::Running(_)), Phase::Train) => Some(masked_row_mean(
                flatten_time_batch(probabilities.clone().detach()),
                base.flat_source_index(),
            )),
            _ => None,
        };
        let softmax_prior = self.prior.as_ref().and_then(Prior::trainable_logits);

        Ok(SequenceOutput {
            base,
            probabilities,
            cost,
            alignment,
            lengths,
            prior_update,
            softmax_prior,
        })
    }

    /// Errors of the output: best path edit distances for the CTC criteria, mismatches against
    /// the forced alignment for `viterbi`, frame errors otherwise.
    pub fn errors(&self, output: &SequenceOutput<B>) -> Result<Option<Tensor<B, 1>>, LossError> {
        let base = &output.base;
        match &self.criterion {
            SequenceCriterion::Ctc | SequenceCriterion::CeCtc => {
                let decoder = self
                    .operators
                    .best_path
                    .as_ref()
                    .ok_or(LossError::MissingOperator {
                        loss: self.criterion.name(),
                        operator: "best path decoder",
                    })?;
                let labels = match self.criterion {
                    SequenceCriterion::Ctc => label_matrix(base, "ctc")?.0.transpose(),
                    _ => collapsed_label_matrix(base, &output.lengths)?,
                };
                let errors =
                    decoder.errors(output.probabilities.clone(), labels, &output.lengths)?;
                Ok(Some(errors.sum()))
            }
            SequenceCriterion::Viterbi { .. } => {
                let Some(alignment) = &output.alignment else {
                    return Ok(None);
                };
                let [time, batch] = alignment.dims();
                Ok(Some(mismatches(
                    argmax_rows(base.flat_z()),
                    alignment.clone().reshape([time * batch]),
                    base.flat_source_index(),
                )))
            }
            _ => base.errors(base.flat_z()),
        }
    }

    /// Fold the prior estimate of a training step into a running prior.
    pub fn update_priors(&mut self, output: &SequenceOutput<B>) {
        if let (Some(Prior::Running(prior)), Some(estimate)) =
            (&mut self.prior, &output.prior_update)
        {
            prior.update(estimate.clone());
        }
    }

    fn missing(&self, operator: &'static str) -> LossError {
        LossError::MissingOperator {
            loss: self.criterion.name(),
            operator,
        }
    }

    fn log_prior(&self, scale: f32, classes: usize) -> Option<Tensor<B, 3>> {
        if scale == 0.0 {
            return None;
        }
        self.prior.as_ref().map(|prior| {
            prior
                .log_priors()
                .detach()
                .reshape([1, 1, classes])
                .mul_scalar(scale)
        })
    }

    fn ctc(
        &self,
        base: &OutputBase<B>,
        probabilities: Tensor<B, 3>,
        lengths: &[usize],
    ) -> Result<Cost<B>, LossError> {
        let op = self.operators.ctc.as_ref().ok_or(self.missing("ctc"))?;
        let (labels, _) = label_matrix(base, "ctc")?;

        let output = op.ctc(probabilities.detach(), labels.transpose(), lengths)?;
        let mut cost = Cost::with_known_grads(
            Some(output.loss.sum()),
            KnownGrads::new().with_logits(output.grad),
            base.policy(),
        );
        cost.ctc_priors = Some(output.priors);

        Ok(cost)
    }

    fn ce_ctc(&self, base: &OutputBase<B>) -> Result<Cost<B>, LossError> {
        let labels = base
            .flat_target()
            .labels()
            .ok_or(LossError::UnsupportedTarget {
                loss: "ce_ctc",
                target: base.target().kind_name(),
            })?;
        let loss = masked_nll(base.flat_z(), labels, base.flat_source_index()).sum();

        Ok(Cost::automatic(Some(loss), base.policy()))
    }

    fn ctc2(&self, base: &OutputBase<B>, lengths: &[usize]) -> Result<Cost<B>, LossError> {
        let labels = base.target().labels().ok_or(LossError::UnsupportedTarget {
            loss: "ctc2",
            target: base.target().kind_name(),
        })?;
        let z = base.z();
        let [time, batch, classes] = z.dims();
        if time == 0 {
            return Ok(Cost::automatic(
                Some(Tensor::zeros([1], &z.device())),
                base.policy(),
            ));
        }
        // Sequences without frames normalize over the first frame; their likelihood is zeroed.
        let normalized = lengths.iter().map(|length| (*length).max(1)).collect();
        let frames = Dim::with_dyn_size("time", normalized);

        let normalizer = reduce_logsumexp::<B, 3, 2>(
            z.clone(),
            &[ReduceAxis::masked(0, &frames, 1)],
            true,
        )?;
        let log_pcx = z.sub(normalizer.reshape([1, batch, classes]));
        let sequences = collapse_frame_labels(labels, lengths, classes - 1);
        let loss = ctc_log_likelihood(log_pcx, &sequences, lengths)?.sum().neg();

        Ok(Cost::automatic(Some(loss), base.policy()))
    }

    fn sprint(
        &self,
        base: &OutputBase<B>,
        probabilities: Tensor<B, 3>,
        lengths: &[usize],
        context: &SequenceContext<B>,
        settings: SprintSettings<'_>,
    ) -> Result<Cost<B>, LossError> {
        let scorer = self.operators.scorer.as_ref().ok_or(self.missing("scorer"))?;
        let z = base.z();
        let [time, batch, classes] = z.dims();
        let mask = base.source_index().reshape([time, batch, 1]);

        let log_posteriors = if settings.exp_normalize {
            activation::log_softmax(z.clone(), 2)
        } else {
            z.clone()
        };
        let log_prior = self.log_prior(settings.prior_scale, classes);
        let log_posteriors = match &log_prior {
            Some(log_prior) => log_posteriors.sub(log_prior.clone()),
            None => log_posteriors,
        };
        let (loss, mut grad) = scorer.loss_and_error_signal(
            &settings.options,
            &context.tags,
            log_posteriors.detach(),
            lengths,
        )?;
        if grad.dims() != [time, batch, classes] {
            return Err(LossError::ShapeMismatch(format!(
                "the scorer returned an error signal of shape {:?} for scores {:?}",
                grad.dims(),
                [time, batch, classes]
            )));
        }

        let mut loss = loss.sum();
        if settings.loss_like_ce {
            let soft_targets = probabilities.clone().detach().sub(grad.clone()).clamp(0.0, 1.0);
            loss = soft_targets
                .mul(probabilities.clone().clamp(1e-38, 1e20).log().neg())
                .mul(mask.clone())
                .sum();
        }

        let s = settings.ce_smoothing;
        if s > 0.0 {
            let labels = base
                .flat_target()
                .labels()
                .ok_or(LossError::UnsupportedTarget {
                    loss: "sprint",
                    target: base.target().kind_name(),
                })?;
            let z = match log_prior {
                Some(log_prior) => z.add(log_prior),
                None => z,
            };
            let ce = masked_nll(
                flatten_time_batch(z.clone()),
                labels.clone(),
                base.flat_source_index(),
            )
            .sum();
            let ce_grad = activation::softmax(z.detach(), 2)
                .sub(one_hot(labels, classes).reshape([time, batch, classes]))
                .mul(mask);
            loss = loss.mul_scalar(1.0 - s).add(ce.mul_scalar(s));
            grad = grad.mul_scalar(1.0 - s).add(ce_grad.mul_scalar(s));
        }

        Ok(Cost::with_known_grads(
            Some(loss),
            KnownGrads::new().with_logits(grad),
            base.policy(),
        ))
    }

    fn fast_bw(
        &self,
        base: &OutputBase<B>,
        probabilities: Tensor<B, 3>,
        context: &SequenceContext<B>,
    ) -> Result<Cost<B>, LossError> {
        let SequenceCriterion::FastBw {
            options,
            am_scale,
            prior_scale,
            gamma,
            bw_norm_class_avg,
            ce_smoothing,
            ce_target_layer_align,
        } = &self.criterion
        else {
            return Err(LossError::InvalidLoss {
                layer: "sequence",
                loss: self.criterion.name().to_string(),
            });
        };
        let forward_backward = self
            .operators
            .forward_backward
            .as_ref()
            .ok_or(self.missing("forward-backward"))?;
        let source = self
            .operators
            .automata
            .as_ref()
            .ok_or(self.missing("alignment automata"))?;
        let [time, batch, classes] = probabilities.dims();
        let frames = base.source_index();
        let mask = frames.clone().reshape([time, batch, 1]);

        let am_scores = probabilities
            .clone()
            .detach()
            .clamp(1e-20, 1e20)
            .log()
            .neg()
            .mul_scalar(*am_scale);
        let am_scores = match self.log_prior(*prior_scale, classes) {
            Some(log_prior) => am_scores.add(log_prior),
            None => am_scores,
        };
        let automata = source.automata(options, &context.tags)?;
        let occupations = forward_backward.occupations(am_scores, &automata, frames.clone())?;

        let mut alignment = occupations.neg().exp();
        if *gamma != 1.0 {
            alignment = alignment.powf_scalar(*gamma);
        }
        if *bw_norm_class_avg {
            let average = class_sum(alignment.clone().mul(mask.clone()))
                .div(frames.clone().sum().clamp_min(1.0));
            let average = average.clamp_min(1e-20).reshape([1, 1, classes]);
            alignment = alignment.div(average);
        }
        if *gamma != 1.0 || *bw_norm_class_avg {
            alignment = renormalize(alignment);
        }
        let baum_welch = alignment.clone();
        if *ce_smoothing > 0.0 {
            let sibling = context.sibling_alignment.clone().ok_or_else(|| {
                LossError::MissingDependency(format!(
                    "the alignment of layer {}",
                    ce_target_layer_align.as_deref().unwrap_or("<unnamed>")
                ))
            })?;
            if sibling.dims() != [time, batch, classes] {
                return Err(LossError::ShapeMismatch(format!(
                    "sibling alignment {:?} for scores {:?}",
                    sibling.dims(),
                    [time, batch, classes]
                )));
            }
            alignment = sibling
                .detach()
                .mul_scalar(*ce_smoothing)
                .add(alignment.mul_scalar(1.0 - ce_smoothing));
        }
        let alignment = alignment.mul(mask.clone());

        let loss = alignment
            .clone()
            .mul(probabilities.clone().clamp(1e-20, 1e20).log().neg())
            .sum();
        let grad = probabilities.clone().detach().sub(alignment.clone()).mul(mask);
        let mut known_grads = KnownGrads::new().with_logits(grad);
        if let Some(Prior::Trained(prior)) = &self.prior {
            if *prior_scale != 0.0 {
                let counts = class_sum(alignment.clone());
                let expected = prior.priors().detach().mul(frames.sum());
                known_grads =
                    known_grads.with_softmax_prior(counts.sub(expected).mul_scalar(*prior_scale));
            }
        }

        let mut cost = Cost::with_known_grads(Some(loss), known_grads, base.policy());
        cost.alignment = Some(baum_welch);

        Ok(cost)
    }

    fn viterbi(
        &self,
        base: &OutputBase<B>,
        lengths: &[usize],
        prior_scale: f32,
    ) -> Result<(Cost<B>, Tensor<B, 2, Int>), LossError> {
        let aligner = self.operators.aligner.as_ref().ok_or(self.missing("aligner"))?;
        let (labels, target_lengths) = label_matrix(base, "viterbi")?;
        let z = base.z();
        let [time, batch, classes] = z.dims();

        let scores = activation::log_softmax(z, 2).detach();
        let scores = match self.log_prior(prior_scale, classes) {
            Some(log_prior) => scores.sub(log_prior),
            None => scores,
        };
        let alignment = aligner.align(lengths, &target_lengths, scores.neg(), labels)?;
        let loss = masked_nll(
            base.flat_z(),
            alignment.clone().reshape([time * batch]),
            base.flat_source_index(),
        )
        .sum();

        Ok((Cost::automatic(Some(loss), base.policy()), alignment))
    }
}

struct SprintSettings<'a> {
    options: &'a SprintOptions,
    exp_normalize: bool,
    prior_scale: f32,
    loss_like_ce: bool,
    ce_smoothing: f32,
}

/// Label sequences `[max_len, batch]` padded with `-1` where the target index is unset, with the
/// number of labels of each sequence.
fn label_matrix<B: Backend>(
    base: &OutputBase<B>,
    loss: &'static str,
) -> Result<(Tensor<B, 2, Int>, Vec<usize>), LossError> {
    let labels = base.target().labels().ok_or(LossError::UnsupportedTarget {
        loss,
        target: base.target().kind_name(),
    })?;
    let [max_len, batch] = labels.dims();
    let labels = match base.target_index() {
        Some(index) if index.dims() != [max_len, batch] => {
            return Err(LossError::ShapeMismatch(format!(
                "target index {:?} for labels {:?}",
                index.dims(),
                [max_len, batch]
            )));
        }
        Some(index) => labels.mask_fill(index.bool_not(), -1),
        None => labels,
    };
    let values = int_values(labels.clone());
    let counts = (0..batch)
        .map(|b| {
            (0..max_len)
                .take_while(|k| values[k * batch + b] >= 0)
                .count()
        })
        .collect();

    Ok((labels, counts))
}

/// Frame labels collapsed to label sequences, as `[batch, max_len]` padded with `-1`.
fn collapsed_label_matrix<B: Backend>(
    base: &OutputBase<B>,
    lengths: &[usize],
) -> Result<Tensor<B, 2, Int>, LossError> {
    let labels = base.target().labels().ok_or(LossError::UnsupportedTarget {
        loss: "ce_ctc",
        target: base.target().kind_name(),
    })?;
    let [_, _, classes] = base.z().dims();
    let device = labels.device();
    let sequences = collapse_frame_labels(labels, lengths, classes - 1);
    let batch = sequences.len();
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let mut values = vec![-1i64; batch * max_len];
    for (b, sequence) in sequences.iter().enumerate() {
        for (k, label) in sequence.iter().enumerate() {
            values[b * max_len + k] = *label as i64;
        }
    }

    Ok(int_tensor(values, [batch, max_len], &device))
}

/// Sum of `[time, batch, classes]` over time and batch.
fn class_sum<B: Backend>(tensor: Tensor<B, 3>) -> Tensor<B, 1> {
    let [time, batch, classes] = tensor.dims();
    tensor
        .reshape([time * batch, classes])
        .sum_dim(0)
        .reshape([classes])
}

/// Normalize each frame of `[time, batch, classes]` to sum to one. All zero frames stay zero.
fn renormalize<B: Backend>(alignment: Tensor<B, 3>) -> Tensor<B, 3> {
    let total = alignment.clone().sum_dim(2).clamp_min(1e-30);
    alignment.div(total)
}

/// Result of a [sequence output layer](SequenceOutputLayer) for one batch.
#[derive(Debug, Clone)]
pub struct SequenceOutput<B: Backend> {
    base: OutputBase<B>,
    probabilities: Tensor<B, 3>,
    cost: Cost<B>,
    alignment: Option<Tensor<B, 2, Int>>,
    lengths: Vec<usize>,
    prior_update: Option<Tensor<B, 1>>,
    softmax_prior: Option<Tensor<B, 1>>,
}

impl<B: Backend> SequenceOutput<B> {
    /// The shared preprocessing.
    pub fn base(&self) -> &OutputBase<B> {
        &self.base
    }

    /// Loss and known gradients.
    pub fn cost(&self) -> &Cost<B> {
        &self.cost
    }

    /// Posteriors `[time, batch, classes]`.
    pub fn output(&self) -> Tensor<B, 3> {
        self.probabilities.clone()
    }

    /// Number of frames of each sequence.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Forced alignment `[time, batch]` of the `viterbi` criterion.
    pub fn hard_alignment(&self) -> Option<Tensor<B, 2, Int>> {
        self.alignment.clone()
    }

    /// Soft alignment `[time, batch, classes]` of the `fast_bw` criterion, before any smoothing
    /// with a sibling alignment, to be passed to layers smoothing with it.
    pub fn soft_alignment(&self) -> Option<Tensor<B, 3>> {
        self.cost.alignment.clone()
    }

    /// Mean posterior over the valid frames, when the layer tracks a running prior in training.
    pub fn prior_update(&self) -> Option<Tensor<B, 1>> {
        self.prior_update.clone()
    }

    /// The tensors the known gradients refer to.
    pub fn grad_targets(&self) -> GradTargets<B> {
        self.base.grad_targets(None, self.softmax_prior.clone())
    }
}
