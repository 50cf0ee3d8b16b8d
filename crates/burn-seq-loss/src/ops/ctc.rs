use burn::tensor::{Int, Tensor, backend::Backend};

use super::{BestPathDecoder, CtcOp, CtcOutput, log_add};
use crate::LossError;
use crate::data::{float_tensor, float_values, int_values};

/// CTC on the host, with the last class as blank.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCtc;

/// Label sequences of a `[batch, max_len]` tensor padded with negative values.
pub(crate) fn label_sequences<B: Backend>(labels: Tensor<B, 2, Int>) -> Vec<Vec<usize>> {
    let [batch, max_len] = labels.dims();
    let values = int_values(labels);

    (0..batch)
        .map(|b| {
            values[b * max_len..(b + 1) * max_len]
                .iter()
                .take_while(|label| **label >= 0)
                .map(|label| *label as usize)
                .collect()
        })
        .collect()
}

fn check_inputs(
    dims: [usize; 3],
    labels: &[Vec<usize>],
    lengths: &[usize],
) -> Result<(), LossError> {
    let [time, batch, classes] = dims;
    if labels.len() != batch || lengths.len() != batch {
        return Err(LossError::ShapeMismatch(format!(
            "CTC over {batch} sequences got {} label sequences and {} lengths",
            labels.len(),
            lengths.len()
        )));
    }
    if let Some(length) = lengths.iter().find(|length| **length > time) {
        return Err(LossError::ShapeMismatch(format!(
            "sequence length {length} exceeds the {time} frames"
        )));
    }
    if let Some(label) = labels.iter().flatten().find(|label| **label + 1 >= classes) {
        return Err(LossError::Operator(format!(
            "label {label} collides with the blank class {}",
            classes - 1
        )));
    }
    Ok(())
}

/// Per sequence view of the log posteriors, `[frame][class]`.
struct Sequence<'a> {
    log_probs: &'a [f64],
    batch: usize,
    b: usize,
    classes: usize,
}

impl Sequence<'_> {
    fn get(&self, t: usize, c: usize) -> f64 {
        self.log_probs[(t * self.batch + self.b) * self.classes + c]
    }
}

/// Label sequence with blanks around and between the labels.
fn extend(labels: &[usize], blank: usize) -> Vec<usize> {
    let mut extended = Vec::with_capacity(2 * labels.len() + 1);
    extended.push(blank);
    for label in labels {
        extended.push(*label);
        extended.push(blank);
    }
    extended
}

fn can_skip(extended: &[usize], s: usize, blank: usize) -> bool {
    s >= 2 && extended[s] != blank && extended[s] != extended[s - 2]
}

/// Class occupations of one sequence and its log-likelihood.
fn occupations(seq: &Sequence<'_>, labels: &[usize], length: usize) -> (Vec<f64>, f64) {
    let blank = seq.classes - 1;
    let extended = extend(labels, blank);
    let states = extended.len();
    let mut occupations = vec![0.0; length * seq.classes];
    if length == 0 {
        let log_likelihood = if labels.is_empty() { 0.0 } else { f64::NEG_INFINITY };
        return (occupations, log_likelihood);
    }

    let mut alpha = vec![f64::NEG_INFINITY; length * states];
    alpha[0] = seq.get(0, extended[0]);
    if states > 1 {
        alpha[1] = seq.get(0, extended[1]);
    }
    for t in 1..length {
        for s in 0..states {
            let mut sum = alpha[(t - 1) * states + s];
            if s >= 1 {
                sum = log_add(sum, alpha[(t - 1) * states + s - 1]);
            }
            if can_skip(&extended, s, blank) {
                sum = log_add(sum, alpha[(t - 1) * states + s - 2]);
            }
            alpha[t * states + s] = sum + seq.get(t, extended[s]);
        }
    }

    let mut beta = vec![f64::NEG_INFINITY; length * states];
    let last = length - 1;
    beta[last * states + states - 1] = seq.get(last, extended[states - 1]);
    if states > 1 {
        beta[last * states + states - 2] = seq.get(last, extended[states - 2]);
    }
    for t in (0..last).rev() {
        for s in 0..states {
            let mut sum = beta[(t + 1) * states + s];
            if s + 1 < states {
                sum = log_add(sum, beta[(t + 1) * states + s + 1]);
            }
            if s + 2 < states && can_skip(&extended, s + 2, blank) {
                sum = log_add(sum, beta[(t + 1) * states + s + 2]);
            }
            beta[t * states + s] = sum + seq.get(t, extended[s]);
        }
    }

    let mut log_likelihood = alpha[last * states + states - 1];
    if states > 1 {
        log_likelihood = log_add(log_likelihood, alpha[last * states + states - 2]);
    }
    if log_likelihood == f64::NEG_INFINITY {
        return (occupations, log_likelihood);
    }

    for t in 0..length {
        for (s, class) in extended.iter().enumerate() {
            let i = t * states + s;
            let log_gamma = alpha[i] + beta[i] - seq.get(t, *class) - log_likelihood;
            occupations[t * seq.classes + class] += log_gamma.exp();
        }
    }

    (occupations, log_likelihood)
}

impl<B: Backend> CtcOp<B> for HostCtc {
    fn ctc(
        &self,
        probs: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Result<CtcOutput<B>, LossError> {
        let dims = probs.dims();
        let [time, batch, classes] = dims;
        let device = probs.device();
        let labels = label_sequences(labels);
        check_inputs(dims, &labels, lengths)?;

        let probs = float_values(probs);
        let log_probs = probs
            .iter()
            .map(|p| (*p as f64).clamp(1e-38, 1e20).ln())
            .collect::<Vec<_>>();

        let mut loss = Vec::with_capacity(batch);
        let mut grad = vec![0.0f32; time * batch * classes];
        let mut priors = vec![0.0f32; classes];

        for (b, labels) in labels.iter().enumerate() {
            let seq = Sequence {
                log_probs: &log_probs,
                batch,
                b,
                classes,
            };
            let (occupations, log_likelihood) = occupations(&seq, labels, lengths[b]);
            if log_likelihood == f64::NEG_INFINITY {
                return Err(LossError::Operator(format!(
                    "no CTC path of {} frames for the {} labels of sequence {b}",
                    lengths[b],
                    labels.len()
                )));
            }
            loss.push(-log_likelihood as f32);

            for t in 0..lengths[b] {
                for c in 0..classes {
                    let i = (t * batch + b) * classes + c;
                    let occupation = occupations[t * classes + c] as f32;
                    grad[i] = probs[i] - occupation;
                    priors[c] += occupation;
                }
            }
        }

        Ok(CtcOutput {
            loss: float_tensor(loss, [batch], &device),
            grad: float_tensor(grad, [time, batch, classes], &device),
            priors: float_tensor(priors, [classes], &device),
        })
    }
}

/// Best path of one sequence: frame arg-max, repeats merged, blanks removed.
pub(crate) fn best_path(
    probs: &[f32],
    batch: usize,
    b: usize,
    classes: usize,
    length: usize,
) -> Vec<usize> {
    let blank = classes - 1;
    let mut decoded = Vec::new();
    let mut previous = None;

    for t in 0..length {
        let row = &probs[(t * batch + b) * classes..(t * batch + b + 1) * classes];
        let best = row
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (c, p)| {
                if *p > best.1 { (c, *p) } else { best }
            })
            .0;
        if Some(best) != previous && best != blank {
            decoded.push(best);
        }
        previous = Some(best);
    }

    decoded
}

pub(crate) fn edit_distance(a: &[usize], b: &[usize]) -> usize {
    let mut row = (0..=b.len()).collect::<Vec<_>>();
    for (i, x) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(x != y);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

impl<B: Backend> BestPathDecoder<B> for HostCtc {
    fn errors(
        &self,
        probs: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Result<Tensor<B, 1>, LossError> {
        let dims = probs.dims();
        let [_, batch, classes] = dims;
        let device = probs.device();
        let labels = label_sequences(labels);
        check_inputs(dims, &labels, lengths)?;
        let probs = float_values(probs);

        let errors = labels
            .iter()
            .enumerate()
            .map(|(b, labels)| {
                let decoded = best_path(&probs, batch, b, classes, lengths[b]);
                edit_distance(&decoded, labels) as f32
            })
            .collect();

        Ok(float_tensor(errors, [batch], &device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{TensorData, Tolerance, ops::FloatElem};

    type FT = FloatElem<TestBackend>;

    #[test]
    fn single_frame_gradient_is_probability_minus_occupation() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 3>::from_floats([[[0.7, 0.3]]], &device);
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[0]], &device);

        let output = HostCtc.ctc(probs, labels, &[1]).unwrap();

        output.loss.into_data().assert_approx_eq::<FT>(
            &TensorData::from([-(0.7f32.ln())]),
            Tolerance::default(),
        );
        output
            .grad
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([[[-0.3, 0.3]]]), Tolerance::default());
        output
            .priors
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([1.0, 0.0]), Tolerance::default());
    }

    #[test]
    fn sums_over_every_alignment() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 3>::full([2, 1, 2], 0.5, &device);
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[0, -1]], &device);

        let output = HostCtc.ctc(probs, labels, &[2]).unwrap();

        // "a a", "a -", "- a"
        output.loss.into_data().assert_approx_eq::<FT>(
            &TensorData::from([-(0.75f32.ln())]),
            Tolerance::default(),
        );
        let first = 2.0 / 3.0;
        output.grad.into_data().assert_approx_eq::<FT>(
            &TensorData::from([
                [[0.5 - first, 0.5 - (1.0 - first)]],
                [[0.5 - first, 0.5 - (1.0 - first)]],
            ]),
            Tolerance::default(),
        );
    }

    #[test]
    fn frames_past_the_length_get_no_gradient() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 3>::from_floats(
            [[[0.7, 0.3], [0.6, 0.4]], [[0.2, 0.8], [0.5, 0.5]]],
            &device,
        );
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[0], [0]], &device);

        let output = HostCtc.ctc(probs, labels, &[2, 1]).unwrap();
        let grad = output.grad.into_data().to_vec::<f32>().unwrap();

        assert_eq!(&grad[6..8], &[0.0, 0.0]);
    }

    #[test]
    fn too_many_labels_for_the_frames_is_an_error() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 3>::full([1, 1, 3], 1.0 / 3.0, &device);
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[0, 1]], &device);

        let result = HostCtc.ctc(probs, labels, &[1]);

        assert!(matches!(result, Err(LossError::Operator(_))));
    }

    #[test]
    fn best_path_errors_are_edit_distances() {
        let device = Default::default();
        // Frames decode to 0 0 - 1, so the best path is [0, 1].
        let probs = Tensor::<TestBackend, 3>::from_floats(
            [[[0.8, 0.1, 0.1]], [[0.8, 0.1, 0.1]], [[0.1, 0.1, 0.8]], [[0.1, 0.8, 0.1]]],
            &device,
        );
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[0, 0, 1]], &device);

        let errors = HostCtc.errors(probs, labels, &[4]).unwrap();

        errors.into_data().assert_eq(&TensorData::from([1.0]), false);
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 3]), 1);
        assert_eq!(edit_distance(&[], &[4, 5]), 2);
    }
}
