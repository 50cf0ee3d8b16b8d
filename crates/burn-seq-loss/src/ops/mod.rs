//! Sequence level operators consumed by the output layers.
//!
//! Each operator is a trait so native kernels or external toolkits can be plugged in. Host
//! implementations working on the CPU copies of the tensors are provided for CTC, best path
//! decoding, forward-backward and monotonic alignment.

mod align;
mod ctc;
mod ctc2;
mod fast_bw;
mod sparse;

pub use align::*;
pub use ctc::*;
pub use ctc2::*;
pub use fast_bw::*;
pub use sparse::*;

use burn::tensor::{Int, Tensor, backend::Backend};
use derive_new::new;

use crate::{LossError, SprintOptions};

/// Result of a [CtcOp].
#[derive(Debug, Clone)]
pub struct CtcOutput<B: Backend> {
    /// Negative log-likelihood per sequence, `[batch]`.
    pub loss: Tensor<B, 1>,
    /// Gradient of the summed loss w.r.t. the logits, `[time, batch, classes]`.
    pub grad: Tensor<B, 3>,
    /// Expected number of frames per class over the batch, `[classes]`.
    pub priors: Tensor<B, 1>,
}

/// Connectionist temporal classification.
pub trait CtcOp<B: Backend> {
    /// Score `labels` (`[batch, max_len]`, padded with `-1`) under the frame posteriors `probs`
    /// (`[time, batch, classes]`), using the first `lengths[b]` frames of each sequence.
    fn ctc(
        &self,
        probs: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Result<CtcOutput<B>, LossError>;
}

/// Decoding errors of the best CTC path.
pub trait BestPathDecoder<B: Backend> {
    /// Edit distance between the best path decoding of `probs` and `labels`, per sequence.
    fn errors(
        &self,
        probs: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Result<Tensor<B, 1>, LossError>;
}

/// Baum-Welch state occupations over an alignment automaton.
pub trait ForwardBackward<B: Backend> {
    /// Occupation of each class per frame in `-log` space, `[time, batch, classes]`.
    ///
    /// `am_scores` are `-log` emission scores and `mask` is `1` on valid frames.
    fn occupations(
        &self,
        am_scores: Tensor<B, 3>,
        automata: &Automata,
        mask: Tensor<B, 2>,
    ) -> Result<Tensor<B, 3>, LossError>;
}

/// Provider of the alignment automata of a batch.
pub trait AlignmentAutomataSource {
    /// Automata of the sequences named by `tags`, in batch order.
    fn automata(&self, options: &SprintOptions, tags: &[String]) -> Result<Automata, LossError>;
}

/// External sequence scorer.
pub trait SequenceScorer<B: Backend> {
    /// Loss per sequence and error signal w.r.t. `log_posteriors` (`[time, batch, classes]`).
    fn loss_and_error_signal(
        &self,
        options: &SprintOptions,
        tags: &[String],
        log_posteriors: Tensor<B, 3>,
        lengths: &[usize],
    ) -> Result<(Tensor<B, 1>, Tensor<B, 3>), LossError>;
}

/// Monotonic forced alignment.
pub trait MonotonicAligner<B: Backend> {
    /// Class of each frame, `[time, batch]`, on the cheapest monotonic path through `labels`
    /// (`[max_len, batch]`) under `neg_log_scores` (`[time, batch, classes]`).
    fn align(
        &self,
        source_lengths: &[usize],
        target_lengths: &[usize],
        neg_log_scores: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
    ) -> Result<Tensor<B, 2, Int>, LossError>;
}

/// One transition of an [Automata].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// Source state.
    pub from: usize,
    /// Target state.
    pub to: usize,
    /// Class emitted while taking the edge.
    pub emission: usize,
    /// Batch entry the edge belongs to.
    pub sequence: usize,
    /// Weight in `-log` space.
    pub weight: f32,
}

/// Alignment automata of a batch, one connected graph per sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Automata {
    /// Transitions of every sequence.
    pub edges: Vec<Edge>,
    /// Start and end state of each sequence.
    pub start_end_states: Vec<(usize, usize)>,
    /// Number of states over the whole batch.
    pub num_states: usize,
}

impl Automata {
    /// Left to right automata that emit each label for one frame or more.
    ///
    /// Every sequence gets an initial state followed by one state per label. An empty label
    /// sequence gives an automaton without edges, which accepts no frame.
    pub fn from_label_sequences(labels: &[Vec<usize>]) -> Self {
        let mut edges = Vec::new();
        let mut start_end_states = Vec::with_capacity(labels.len());
        let mut offset = 0;

        for (sequence, labels) in labels.iter().enumerate() {
            let start = offset;
            for (k, label) in labels.iter().enumerate() {
                let state = start + k + 1;
                edges.push(Edge {
                    from: state - 1,
                    to: state,
                    emission: *label,
                    sequence,
                    weight: 0.0,
                });
                edges.push(Edge {
                    from: state,
                    to: state,
                    emission: *label,
                    sequence,
                    weight: 0.0,
                });
            }
            start_end_states.push((start, start + labels.len()));
            offset += labels.len() + 1;
        }

        Self {
            edges,
            start_end_states,
            num_states: offset,
        }
    }

    /// Number of sequences.
    pub fn num_sequences(&self) -> usize {
        self.start_end_states.len()
    }
}

/// An automata source always returning the same automata.
#[derive(Debug, Clone, new)]
pub struct FixedAutomata {
    automata: Automata,
}

impl AlignmentAutomataSource for FixedAutomata {
    fn automata(&self, _options: &SprintOptions, tags: &[String]) -> Result<Automata, LossError> {
        if tags.len() != self.automata.num_sequences() {
            return Err(LossError::Operator(format!(
                "automata cover {} sequences, the batch has {}",
                self.automata.num_sequences(),
                tags.len()
            )));
        }
        Ok(self.automata.clone())
    }
}

/// The operators available to the sequence criteria.
pub struct Operators<B: Backend> {
    /// CTC loss.
    pub ctc: Option<Box<dyn CtcOp<B>>>,
    /// CTC best path errors.
    pub best_path: Option<Box<dyn BestPathDecoder<B>>>,
    /// Forward-backward.
    pub forward_backward: Option<Box<dyn ForwardBackward<B>>>,
    /// Alignment automata.
    pub automata: Option<Box<dyn AlignmentAutomataSource>>,
    /// External scorer.
    pub scorer: Option<Box<dyn SequenceScorer<B>>>,
    /// Forced alignment.
    pub aligner: Option<Box<dyn MonotonicAligner<B>>>,
}

impl<B: Backend> Default for Operators<B> {
    fn default() -> Self {
        Self {
            ctc: None,
            best_path: None,
            forward_backward: None,
            automata: None,
            scorer: None,
            aligner: None,
        }
    }
}

impl<B: Backend> core::fmt::Debug for Operators<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Operators")
            .field("ctc", &self.ctc.is_some())
            .field("best_path", &self.best_path.is_some())
            .field("forward_backward", &self.forward_backward.is_some())
            .field("automata", &self.automata.is_some())
            .field("scorer", &self.scorer.is_some())
            .field("aligner", &self.aligner.is_some())
            .finish()
    }
}

impl<B: Backend> Operators<B> {
    /// No operator.
    pub fn new() -> Self {
        Self::default()
    }

    /// The host implementations of CTC, best path decoding, forward-backward and alignment.
    pub fn host() -> Self {
        Self::new()
            .with_ctc(HostCtc)
            .with_best_path(HostCtc)
            .with_forward_backward(HostBaumWelch)
            .with_aligner(HostAligner)
    }

    /// Set the CTC operator.
    pub fn with_ctc(mut self, op: impl CtcOp<B> + 'static) -> Self {
        self.ctc = Some(Box::new(op));
        self
    }

    /// Set the best path decoder.
    pub fn with_best_path(mut self, op: impl BestPathDecoder<B> + 'static) -> Self {
        self.best_path = Some(Box::new(op));
        self
    }

    /// Set the forward-backward operator.
    pub fn with_forward_backward(mut self, op: impl ForwardBackward<B> + 'static) -> Self {
        self.forward_backward = Some(Box::new(op));
        self
    }

    /// Set the automata source.
    pub fn with_automata(mut self, source: impl AlignmentAutomataSource + 'static) -> Self {
        self.automata = Some(Box::new(source));
        self
    }

    /// Set the external scorer.
    pub fn with_scorer(mut self, scorer: impl SequenceScorer<B> + 'static) -> Self {
        self.scorer = Some(Box::new(scorer));
        self
    }

    /// Set the forced aligner.
    pub fn with_aligner(mut self, aligner: impl MonotonicAligner<B> + 'static) -> Self {
        self.aligner = Some(Box::new(aligner));
        self
    }
}

/// `-log(exp(-a) + exp(-b))`.
pub(crate) fn neg_log_add(a: f64, b: f64) -> f64 {
    if a == f64::INFINITY {
        return b;
    }
    if b == f64::INFINITY {
        return a;
    }
    let min = a.min(b);
    min - (-(a - b).abs()).exp().ln_1p()
}

/// `log(exp(a) + exp(b))`.
pub(crate) fn log_add(a: f64, b: f64) -> f64 {
    -neg_log_add(-a, -b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_automata_are_left_to_right() {
        let automata = Automata::from_label_sequences(&[vec![2, 0], vec![1]]);

        assert_eq!(automata.num_states, 5);
        assert_eq!(automata.start_end_states, vec![(0, 2), (3, 4)]);
        assert_eq!(automata.edges.len(), 6);
        assert_eq!(
            automata.edges[2],
            Edge {
                from: 1,
                to: 2,
                emission: 0,
                sequence: 0,
                weight: 0.0
            }
        );
    }

    #[test]
    fn log_space_addition() {
        let sum = log_add(0.25f64.ln(), 0.5f64.ln());

        assert!((sum - 0.75f64.ln()).abs() < 1e-12);
        assert_eq!(log_add(f64::NEG_INFINITY, -1.0), -1.0);
    }
}
