use burn::tensor::{Tensor, backend::Backend};

use super::{Automata, ForwardBackward, neg_log_add};
use crate::LossError;
use crate::data::{float_tensor, float_values, lengths};

/// Score given to classes a frame cannot be aligned to, in `-log` space.
pub const UNREACHABLE_SCORE: f32 = 1e30;

/// Forward-backward on the host, in `-log` space.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBaumWelch;

fn check_automata(automata: &Automata, batch: usize, classes: usize) -> Result<(), LossError> {
    if automata.num_sequences() != batch {
        return Err(LossError::Operator(format!(
            "automata cover {} sequences, the batch has {batch}",
            automata.num_sequences()
        )));
    }
    let out_of_range = automata.edges.iter().find(|edge| {
        edge.from >= automata.num_states
            || edge.to >= automata.num_states
            || edge.emission >= classes
            || edge.sequence >= batch
    });
    if let Some(edge) = out_of_range {
        return Err(LossError::Operator(format!("invalid automaton edge {edge:?}")));
    }
    if let Some((start, end)) = automata
        .start_end_states
        .iter()
        .find(|(start, end)| *start >= automata.num_states || *end >= automata.num_states)
    {
        return Err(LossError::Operator(format!(
            "start/end states ({start}, {end}) outside of {} states",
            automata.num_states
        )));
    }
    Ok(())
}

impl<B: Backend> ForwardBackward<B> for HostBaumWelch {
    fn occupations(
        &self,
        am_scores: Tensor<B, 3>,
        automata: &Automata,
        mask: Tensor<B, 2>,
    ) -> Result<Tensor<B, 3>, LossError> {
        let [time, batch, classes] = am_scores.dims();
        let device = am_scores.device();
        check_automata(automata, batch, classes)?;
        let lengths = lengths(mask);
        let am = float_values(am_scores);
        let states = automata.num_states;

        let mut output = vec![UNREACHABLE_SCORE; time * batch * classes];
        for (b, (start, end)) in automata.start_end_states.iter().enumerate() {
            let length = lengths[b];
            let edges = automata
                .edges
                .iter()
                .filter(|edge| edge.sequence == b)
                .collect::<Vec<_>>();
            let score = |t: usize, c: usize| am[(t * batch + b) * classes + c] as f64;

            let mut fwd = vec![f64::INFINITY; (length + 1) * states];
            fwd[*start] = 0.0;
            for t in 0..length {
                for edge in &edges {
                    let from = fwd[t * states + edge.from];
                    let next = &mut fwd[(t + 1) * states + edge.to];
                    *next = neg_log_add(
                        *next,
                        from + edge.weight as f64 + score(t, edge.emission),
                    );
                }
            }

            let mut bwd = vec![f64::INFINITY; (length + 1) * states];
            bwd[length * states + end] = 0.0;
            for t in (0..length).rev() {
                for edge in &edges {
                    let to = bwd[(t + 1) * states + edge.to];
                    let previous = &mut bwd[t * states + edge.from];
                    *previous = neg_log_add(
                        *previous,
                        to + edge.weight as f64 + score(t, edge.emission),
                    );
                }
            }

            let total = fwd[length * states + end];
            if !total.is_finite() {
                log::warn!("Sequence {b} has no path through its automaton in {length} frames");
                continue;
            }

            for t in 0..length {
                let mut occupation = vec![f64::INFINITY; classes];
                for edge in &edges {
                    let path = fwd[t * states + edge.from]
                        + edge.weight as f64
                        + score(t, edge.emission)
                        + bwd[(t + 1) * states + edge.to];
                    occupation[edge.emission] = neg_log_add(occupation[edge.emission], path);
                }
                for (c, value) in occupation.into_iter().enumerate() {
                    if value.is_finite() {
                        output[(t * batch + b) * classes + c] = (value - total) as f32;
                    }
                }
            }
        }

        Ok(float_tensor(output, [time, batch, classes], &device))
    }
}
