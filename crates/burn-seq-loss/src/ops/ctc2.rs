use burn::tensor::{Int, Tensor, backend::Backend};
use burn_loop::{Dim, ScanOptions, ScanOutput, scan};

use crate::LossError;
use crate::data::{float_tensor, int_tensor, int_values};

/// Log-probability standing in for `log(0)` in the tensorized CTC recursion.
pub const CTC_LOG_ZERO: f32 = -1e5;

/// Label sequences of frame labels `[time, batch]`: repeats merged, then `blank` removed.
pub fn collapse_frame_labels<B: Backend>(
    labels: Tensor<B, 2, Int>,
    lengths: &[usize],
    blank: usize,
) -> Vec<Vec<usize>> {
    let [time, batch] = labels.dims();
    let values = int_values(labels);

    (0..batch)
        .map(|b| {
            let mut collapsed = Vec::new();
            let mut previous = None;
            for t in 0..lengths.get(b).copied().unwrap_or(time).min(time) {
                let label = values[t * batch + b];
                if previous != Some(label) && label >= 0 && label as usize != blank {
                    collapsed.push(label as usize);
                }
                previous = Some(label);
            }
            collapsed
        })
        .collect()
}

fn shift_states<B: Backend>(alpha: Tensor<B, 2>, shift: usize) -> Tensor<B, 2> {
    let [batch, states] = alpha.dims();
    let device = alpha.device();
    if shift >= states {
        return Tensor::full([batch, states], CTC_LOG_ZERO, &device);
    }

    Tensor::cat(
        vec![
            Tensor::full([batch, shift], CTC_LOG_ZERO, &device),
            alpha.slice([0..batch, 0..states - shift]),
        ],
        1,
    )
}

/// `log(sum(exp(x)))` over the last axis of `[batch, states, n]`.
fn log_sum_exp<B: Backend>(stacked: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, states, _] = stacked.dims();
    let max = stacked.clone().max_dim(2);

    stacked
        .sub(max.clone())
        .exp()
        .sum_dim(2)
        .log()
        .add(max)
        .reshape([batch, states])
}

/// Log-likelihood of each label sequence under the frame log-probabilities `log_probs`
/// (`[time, batch, classes]`), with the last class as blank.
///
/// The forward recursion runs as a [scan] over the frames, so the result is differentiable
/// w.r.t. `log_probs`. Frames past `lengths[b]` leave the forward variables untouched and
/// sequences without frames score `0`.
pub fn ctc_log_likelihood<B: Backend>(
    log_probs: Tensor<B, 3>,
    labels: &[Vec<usize>],
    lengths: &[usize],
) -> Result<Tensor<B, 1>, LossError> {
    let [time, batch, classes] = log_probs.dims();
    let device = log_probs.device();
    if labels.len() != batch || lengths.len() != batch {
        return Err(LossError::ShapeMismatch(format!(
            "CTC over {batch} sequences got {} label sequences and {} lengths",
            labels.len(),
            lengths.len()
        )));
    }
    if time == 0 {
        return Ok(Tensor::zeros([batch], &device));
    }
    let blank = classes - 1;
    let max_len = labels.iter().map(Vec::len).max().unwrap_or(0);
    let states = 2 * max_len + 1;

    let mut extended = vec![blank as i64; batch * states];
    let mut skip = vec![CTC_LOG_ZERO; batch * states];
    let mut start = vec![CTC_LOG_ZERO; batch * states];
    let mut keep = vec![0.0; time * batch * states];
    for (b, labels) in labels.iter().enumerate() {
        if let Some(label) = labels.iter().find(|label| **label >= blank) {
            return Err(LossError::Operator(format!(
                "label {label} collides with the blank class {blank}"
            )));
        }
        for (k, label) in labels.iter().enumerate() {
            extended[b * states + 2 * k + 1] = *label as i64;
        }
        for s in 2..states {
            let label = extended[b * states + s];
            if label != blank as i64 && label != extended[b * states + s - 2] {
                skip[b * states + s] = 0.0;
            }
        }
        start[b * states] = 0.0;
        if states > 1 {
            start[b * states + 1] = 0.0;
        }
        for t in 0..lengths[b].min(time) {
            keep[(t * batch + b) * states..(t * batch + b + 1) * states].fill(1.0);
        }
    }

    let extended = int_tensor::<B, 2>(extended, [batch, states], &device);
    let emissions = log_probs.gather(
        2,
        extended.reshape([1, batch, states]).repeat_dim(0, time),
    );
    let skip = float_tensor::<B, 2>(skip, [batch, states], &device);
    let keep = float_tensor::<B, 3>(keep, [time, batch, states], &device);

    let alpha = emissions
        .clone()
        .slice([0..1, 0..batch, 0..states])
        .reshape([batch, states])
        .add(float_tensor(start, [batch, states], &device));

    let alpha = if time > 1 {
        let output: ScanOutput<Tensor<B, 2>, B, 3> = scan(
            ScanOptions::new().with_spatial_dim(Dim::with_static_size("time", time - 1)),
            alpha,
            (
                emissions.slice([1..time, 0..batch, 0..states]),
                keep.slice([1..time, 0..batch, 0..states]),
            ),
            &[],
            None,
            |alpha: Tensor<B, 2>, (emission, keep): (Tensor<B, 2>, Tensor<B, 2>)| {
                let stacked = Tensor::stack::<3>(
                    vec![
                        alpha.clone(),
                        shift_states(alpha.clone(), 1),
                        shift_states(alpha.clone(), 2).add(skip.clone()),
                    ],
                    2,
                );
                let updated = log_sum_exp(stacked).add(emission);
                let alpha = keep
                    .clone()
                    .mul(updated)
                    .add(keep.neg().add_scalar(1.0).mul(alpha));

                (alpha, Vec::<Tensor<B, 2>>::new())
            },
            &device,
        )?;
        output.state
    } else {
        alpha
    };

    let last = labels.iter().map(|labels| 2 * labels.len() as i64).collect::<Vec<_>>();
    let previous = last.iter().map(|s| (s - 1).max(0)).collect::<Vec<_>>();
    let previous_penalty = labels
        .iter()
        .map(|labels| if labels.is_empty() { CTC_LOG_ZERO } else { 0.0 })
        .collect::<Vec<_>>();
    let nonempty = lengths
        .iter()
        .map(|length| if *length > 0 { 1.0 } else { 0.0 })
        .collect::<Vec<_>>();

    let finals = Tensor::cat(
        vec![
            alpha
                .clone()
                .gather(1, int_tensor(last, [batch, 1], &device)),
            alpha
                .gather(1, int_tensor(previous, [batch, 1], &device))
                .add(float_tensor(previous_penalty, [batch, 1], &device)),
        ],
        1,
    );
    let log_likelihood = log_sum_exp(finals.reshape([batch, 1, 2])).reshape([batch]);

    Ok(log_likelihood.mul(float_tensor(nonempty, [batch], &device)))
}
