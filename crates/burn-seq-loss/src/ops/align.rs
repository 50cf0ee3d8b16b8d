use burn::tensor::{Int, Tensor, backend::Backend};

use super::MonotonicAligner;
use crate::LossError;
use crate::data::{float_values, int_tensor, int_values};

/// Viterbi alignment on the host.
///
/// Each label covers one frame or more, in order, and every frame belongs to a label.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAligner;

fn align_sequence(
    scores: impl Fn(usize, usize) -> f64,
    labels: &[usize],
    frames: usize,
) -> Vec<usize> {
    let positions = labels.len();
    let mut cost = vec![f64::INFINITY; frames * positions];
    let mut advanced = vec![false; frames * positions];

    cost[0] = scores(0, labels[0]);
    for t in 1..frames {
        // Position k is only reachable once k frames have passed, and must leave room for
        // the remaining labels.
        let first = (t + positions).saturating_sub(frames);
        for k in first..positions.min(t + 1) {
            let stay = cost[(t - 1) * positions + k];
            let advance = if k > 0 {
                cost[(t - 1) * positions + k - 1]
            } else {
                f64::INFINITY
            };
            let (best, moved) = if advance < stay {
                (advance, true)
            } else {
                (stay, false)
            };
            cost[t * positions + k] = best + scores(t, labels[k]);
            advanced[t * positions + k] = moved;
        }
    }

    let mut alignment = vec![0; frames];
    let mut k = positions - 1;
    for t in (0..frames).rev() {
        alignment[t] = labels[k];
        if t > 0 && advanced[t * positions + k] {
            k -= 1;
        }
    }
    alignment
}

impl<B: Backend> MonotonicAligner<B> for HostAligner {
    fn align(
        &self,
        source_lengths: &[usize],
        target_lengths: &[usize],
        neg_log_scores: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
    ) -> Result<Tensor<B, 2, Int>, LossError> {
        let [time, batch, classes] = neg_log_scores.dims();
        let [max_len, label_batch] = labels.dims();
        let device = neg_log_scores.device();
        if label_batch != batch || source_lengths.len() != batch || target_lengths.len() != batch
        {
            return Err(LossError::ShapeMismatch(format!(
                "alignment of {batch} sequences got {label_batch} label columns, {} source and {} \
                 target lengths",
                source_lengths.len(),
                target_lengths.len()
            )));
        }
        let scores = float_values(neg_log_scores);
        let labels = int_values(labels);

        let mut alignment = vec![0i64; time * batch];
        for b in 0..batch {
            let (frames, positions) = (source_lengths[b].min(time), target_lengths[b]);
            if positions == 0 || positions > max_len {
                return Err(LossError::Operator(format!(
                    "sequence {b} has {positions} labels, expected 1 to {max_len}"
                )));
            }
            if frames < positions {
                return Err(LossError::Operator(format!(
                    "sequence {b} has {positions} labels for {frames} frames"
                )));
            }
            let sequence = (0..positions)
                .map(|k| labels[k * batch + b])
                .map(|label| {
                    usize::try_from(label)
                        .ok()
                        .filter(|label| *label < classes)
                        .ok_or_else(|| {
                            LossError::Operator(format!(
                                "label {label} outside of {classes} classes"
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let score = |t: usize, c: usize| scores[(t * batch + b) * classes + c] as f64;
            for (t, label) in align_sequence(score, &sequence, frames).into_iter().enumerate() {
                alignment[t * batch + b] = label as i64;
            }
        }

        Ok(int_tensor(alignment, [time, batch], &device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    use crate::TestBackend;

    #[test]
    fn follows_the_cheapest_monotonic_path() {
        let device = Default::default();
        // Frame 1 prefers class 1, but label 0 must come first and last is label 1.
        let scores = Tensor::<TestBackend, 3>::from_floats(
            [[[0.1, 2.0]], [[1.0, 0.2]], [[0.5, 0.4]], [[3.0, 0.1]]],
            &device,
        );
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[0], [1]], &device);

        let alignment = HostAligner.align(&[4], &[2], scores, labels).unwrap();

        alignment
            .into_data()
            .assert_eq(&TensorData::from([[0i64], [1], [1], [1]]), false);
    }

    #[test]
    fn padded_frames_are_zero() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 3>::zeros([3, 2, 3], &device);
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[2, 1], [1, 0]], &device);

        let alignment = HostAligner.align(&[3, 1], &[2, 1], scores, labels).unwrap();

        alignment
            .into_data()
            .assert_eq(&TensorData::from([[2i64, 1], [1, 0], [1, 0]]), false);
    }

    #[test]
    fn more_labels_than_frames_is_an_error() {
        let device = Default::default();

        let result = HostAligner.align(
            &[1],
            &[2],
            Tensor::<TestBackend, 3>::zeros([1, 1, 2], &device),
            Tensor::<TestBackend, 2, Int>::from_ints([[0], [1]], &device),
        );

        assert!(matches!(result, Err(LossError::Operator(_))));
    }
}
