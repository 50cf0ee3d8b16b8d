use burn::tensor::{Bool, Tensor, backend::Backend};

use crate::{Dim, ExecutionMode, LoopError, TensorArray, try_while_loop};

/// Inputs a [scan] iterates over, one slice per step along their leading axis.
///
/// `()` stands for "no inputs". Float tensors of rank 2 to 4 yield their slices with the
/// leading axis removed, and pairs or triples of inputs are sliced together.
pub trait ScanInput<B: Backend> {
    /// What the body receives at each step.
    type Step;

    /// Length of the leading axis, `None` when there is no input at all.
    fn steps(&self) -> Result<Option<usize>, LoopError>;

    /// The slice at position `index` of the leading axis.
    fn step(&self, index: usize) -> Self::Step;
}

impl<B: Backend> ScanInput<B> for () {
    type Step = ();

    fn steps(&self) -> Result<Option<usize>, LoopError> {
        Ok(None)
    }

    fn step(&self, _index: usize) -> Self::Step {}
}

macro_rules! scan_input_tensor {
    ($rank:expr, $step_rank:expr) => {
        impl<B: Backend> ScanInput<B> for Tensor<B, $rank> {
            type Step = Tensor<B, $step_rank>;

            fn steps(&self) -> Result<Option<usize>, LoopError> {
                Ok(Some(self.dims()[0]))
            }

            fn step(&self, index: usize) -> Self::Step {
                let dims = self.dims();
                let ranges = core::array::from_fn::<_, $rank, _>(|i| {
                    if i == 0 { index..index + 1 } else { 0..dims[i] }
                });
                let mut shape = [0; $step_rank];
                shape.copy_from_slice(&dims[1..]);

                self.clone().slice(ranges).reshape(shape)
            }
        }
    };
}

scan_input_tensor!(2, 1);
scan_input_tensor!(3, 2);
scan_input_tensor!(4, 3);

fn merge_steps(a: Option<usize>, b: Option<usize>) -> Result<Option<usize>, LoopError> {
    match (a, b) {
        (Some(a), Some(b)) if a != b => Err(LoopError::InvalidArguments(format!(
            "scan inputs have different lengths: {a} and {b}"
        ))),
        (Some(a), _) | (None, Some(a)) => Ok(Some(a)),
        (None, None) => Ok(None),
    }
}

impl<B: Backend, X1: ScanInput<B>, X2: ScanInput<B>> ScanInput<B> for (X1, X2) {
    type Step = (X1::Step, X2::Step);

    fn steps(&self) -> Result<Option<usize>, LoopError> {
        merge_steps(self.0.steps()?, self.1.steps()?)
    }

    fn step(&self, index: usize) -> Self::Step {
        (self.0.step(index), self.1.step(index))
    }
}

impl<B: Backend, X1: ScanInput<B>, X2: ScanInput<B>, X3: ScanInput<B>> ScanInput<B>
    for (X1, X2, X3)
{
    type Step = (X1::Step, X2::Step, X3::Step);

    fn steps(&self) -> Result<Option<usize>, LoopError> {
        merge_steps(merge_steps(self.0.steps()?, self.1.steps()?)?, self.2.steps()?)
    }

    fn step(&self, index: usize) -> Self::Step {
        (self.0.step(index), self.1.step(index), self.2.step(index))
    }
}

/// Options of a [scan].
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Axis to iterate over. When absent or unknown, the loop runs until its condition fails.
    pub spatial_dim: Option<Dim>,
    /// Upper bound on the number of iterations of a condition driven loop.
    pub max_seq_len: Option<usize>,
    /// How the backend executes.
    pub mode: ExecutionMode,
}

impl ScanOptions {
    /// Options for a condition driven scan in eager mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate over the given axis.
    pub fn with_spatial_dim(mut self, dim: Dim) -> Self {
        self.spatial_dim = Some(dim);
        self
    }

    /// Stop after at most `max_seq_len` iterations.
    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    /// Set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Result of a [scan].
#[derive(Debug)]
pub struct ScanOutput<S, B: Backend, const D2: usize> {
    /// Final loop state.
    pub state: S,
    /// Per step outputs stacked along a new leading axis, one tensor per output template.
    pub ys: Vec<Tensor<B, D2>>,
    /// The iterated axis, with its realized lengths for condition driven loops.
    pub spatial_dim: Dim,
}

/// Per batch entry stop condition of a condition driven [scan].
pub type ScanCond<'a, S, B> = &'a mut dyn FnMut(&S) -> Tensor<B, 1, Bool>;

struct CondLoop<S, B: Backend, const D: usize> {
    i: usize,
    seq_len: Vec<usize>,
    prev_cond: Vec<bool>,
    state: S,
    arrays: Vec<TensorArray<B, D>>,
}

struct AxisLoop<S, B: Backend, const D: usize> {
    i: usize,
    state: S,
    arrays: Vec<TensorArray<B, D>>,
}

/// Iterate `body` over an axis, accumulating its per step outputs.
///
/// The body maps `(state, x)` to `(state, y)`, where `y` holds one tensor per template in `ys`.
///
/// Two modes exist:
///
/// - **Unknown length** (`spatial_dim` absent or unknown): `cond` is required and `xs` must be
///   `()`. The loop keeps running while `cond` holds for any batch entry, bounded by
///   `max_seq_len`. Once `cond` fails for an entry it stays failed, and the entry's realized
///   length stops growing. The realized lengths are written into the returned dim.
/// - **Known length**: `cond` must be absent. The body runs once per position of the axis and
///   receives the matching slice of `xs`.
///
/// Outputs are stacked along a new leading axis, so `D2` must be `D + 1`.
pub fn scan<B, S, X, F, const D: usize, const D2: usize>(
    options: ScanOptions,
    initial: S,
    xs: X,
    ys: &[[usize; D]],
    cond: Option<ScanCond<'_, S, B>>,
    body: F,
    device: &B::Device,
) -> Result<ScanOutput<S, B, D2>, LoopError>
where
    B: Backend,
    X: ScanInput<B>,
    F: FnMut(S, X::Step) -> (S, Vec<Tensor<B, D>>),
{
    let arrays = ys
        .iter()
        .map(|template| TensorArray::new(*template, device))
        .collect::<Vec<_>>();

    match options.spatial_dim {
        Some(ref dim) if dim.is_dim_known() => {
            if cond.is_some() {
                return Err(LoopError::InvalidArguments(format!(
                    "dim {} is known, a stop condition cannot be used",
                    dim.name()
                )));
            }
            scan_known(options, initial, xs, arrays, body)
        }
        _ => {
            let Some(cond) = cond else {
                return Err(LoopError::InvalidArguments(
                    "the scan dim is unknown, a stop condition is required".into(),
                ));
            };
            if xs.steps()?.is_some() {
                return Err(LoopError::InvalidArguments(
                    "the scan dim is unknown, inputs cannot be iterated".into(),
                ));
            }
            scan_until(options, initial, xs, arrays, cond, body)
        }
    }
}

fn push_outputs<B: Backend, const D: usize>(
    step: usize,
    arrays: Vec<TensorArray<B, D>>,
    outputs: Vec<Tensor<B, D>>,
) -> Result<Vec<TensorArray<B, D>>, LoopError> {
    if outputs.len() != arrays.len() {
        return Err(LoopError::StructureMismatch {
            step,
            reason: format!(
                "expected {} outputs, the body produced {}",
                arrays.len(),
                outputs.len()
            ),
        });
    }

    arrays
        .into_iter()
        .zip(outputs)
        .map(|(array, output)| {
            array.push_back(output).map_err(|err| match err {
                LoopError::StructureMismatch { reason, .. } => {
                    LoopError::StructureMismatch { step, reason }
                }
                err => err,
            })
        })
        .collect()
}

fn stack_outputs<B: Backend, const D: usize, const D2: usize>(
    arrays: Vec<TensorArray<B, D>>,
) -> Result<Vec<Tensor<B, D2>>, LoopError> {
    arrays.into_iter().map(|array| array.stack::<D2>(0)).collect()
}

fn read_cond<B: Backend>(cond: Tensor<B, 1, Bool>) -> Vec<bool> {
    cond.into_data().iter::<bool>().collect()
}

fn scan_until<B, S, X, F, const D: usize, const D2: usize>(
    options: ScanOptions,
    initial: S,
    xs: X,
    arrays: Vec<TensorArray<B, D>>,
    cond: ScanCond<'_, S, B>,
    mut body: F,
) -> Result<ScanOutput<S, B, D2>, LoopError>
where
    B: Backend,
    X: ScanInput<B>,
    F: FnMut(S, X::Step) -> (S, Vec<Tensor<B, D>>),
{
    let mut spatial_dim = options
        .spatial_dim
        .unwrap_or_else(|| Dim::unknown("scan"));
    let max_seq_len = options.max_seq_len;

    let prev_cond = read_cond(cond(&initial));
    let initial = CondLoop {
        i: 0,
        seq_len: vec![0; prev_cond.len()],
        prev_cond,
        state: initial,
        arrays,
    };

    let result = try_while_loop(
        options.mode,
        |looped: &CondLoop<S, B, D>| {
            looped.prev_cond.iter().any(|c| *c) && max_seq_len.is_none_or(|max| looped.i < max)
        },
        |looped| {
            let CondLoop {
                i,
                mut seq_len,
                prev_cond,
                state,
                arrays,
            } = looped;

            let (state, outputs) = body(state, xs.step(i));
            let arrays = push_outputs(i, arrays, outputs)?;

            let cond = read_cond(cond(&state));
            if cond.len() != prev_cond.len() {
                return Err(LoopError::InvalidArguments(format!(
                    "the stop condition covers {} batch entries at step {i}, expected {}",
                    cond.len(),
                    prev_cond.len()
                )));
            }
            let cond = cond
                .into_iter()
                .zip(prev_cond)
                .map(|(c, prev)| c && prev)
                .collect::<Vec<_>>();
            for (len, active) in seq_len.iter_mut().zip(cond.iter()) {
                *len += *active as usize;
            }

            Ok(CondLoop {
                i: i + 1,
                seq_len,
                prev_cond: cond,
                state,
                arrays,
            })
        },
        initial,
    )?;

    log::debug!(
        "scan over {} stopped after {} iterations",
        spatial_dim.name(),
        result.i
    );
    spatial_dim.set_dyn_size(result.seq_len);

    Ok(ScanOutput {
        state: result.state,
        ys: stack_outputs(result.arrays)?,
        spatial_dim,
    })
}

fn scan_known<B, S, X, F, const D: usize, const D2: usize>(
    options: ScanOptions,
    initial: S,
    xs: X,
    arrays: Vec<TensorArray<B, D>>,
    mut body: F,
) -> Result<ScanOutput<S, B, D2>, LoopError>
where
    B: Backend,
    X: ScanInput<B>,
    F: FnMut(S, X::Step) -> (S, Vec<Tensor<B, D>>),
{
    let Some(spatial_dim) = options.spatial_dim else {
        return Err(LoopError::InvalidArguments(
            "a known length scan needs a dim".into(),
        ));
    };
    let steps = spatial_dim.max_size().unwrap_or(0);

    if let Some(len) = xs.steps()? {
        if len != steps {
            return Err(LoopError::InvalidArguments(format!(
                "inputs have {len} steps but dim {} has {steps}",
                spatial_dim.name()
            )));
        }
    }
    if options.max_seq_len.is_some() {
        log::warn!(
            "max_seq_len is ignored when scanning over the known dim {}",
            spatial_dim.name()
        );
    }

    let result = try_while_loop(
        options.mode,
        |looped: &AxisLoop<S, B, D>| looped.i < steps,
        |looped| {
            let AxisLoop { i, state, arrays } = looped;
            let (state, outputs) = body(state, xs.step(i));
            let arrays = push_outputs(i, arrays, outputs)?;

            Ok(AxisLoop {
                i: i + 1,
                state,
                arrays,
            })
        },
        AxisLoop {
            i: 0,
            state: initial,
            arrays,
        },
    )?;

    Ok(ScanOutput {
        state: result.state,
        ys: stack_outputs(result.arrays)?,
        spatial_dim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::TensorData;

    type TB = TestBackend;

    fn flags(values: [bool; 2]) -> Tensor<TB, 1, Bool> {
        Tensor::from_data(TensorData::from(values), &Default::default())
    }

    #[test]
    fn always_true_condition_runs_max_seq_len_iterations() {
        let device = Default::default();
        let mut cond = |_: &usize| flags([true, true]);

        let output = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new().with_max_seq_len(4),
            0usize,
            (),
            &[[2]],
            Some(&mut cond),
            |i, ()| {
                let y = Tensor::<TB, 1>::full([2], i as f32, &device);
                (i + 1, vec![y])
            },
            &device,
        )
        .unwrap();

        assert_eq!(output.state, 4);
        assert_eq!(output.spatial_dim.dyn_size(), Some([4, 4].as_slice()));
        output.ys[0].clone().into_data().assert_eq(
            &TensorData::from([[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]),
            false,
        );
    }

    #[test]
    fn stopped_entries_keep_their_length() {
        let device = Default::default();
        // Entry 0 fails at step 2 and would hold again at step 3, entry 1 fails at step 4.
        let mut cond = |i: &usize| flags([*i != 2, *i < 4]);
        let mut calls = 0;

        let output = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new().with_max_seq_len(10),
            0usize,
            (),
            &[[2]],
            Some(&mut cond),
            |i, ()| {
                calls += 1;
                (i + 1, vec![Tensor::zeros([2], &device)])
            },
            &device,
        )
        .unwrap();

        assert_eq!(calls, 4);
        assert_eq!(output.spatial_dim.dyn_size(), Some([1, 3].as_slice()));
        assert_eq!(output.ys[0].dims(), [4, 2]);
    }

    #[test]
    fn known_dim_feeds_input_slices() {
        let device = Default::default();
        let xs = Tensor::<TB, 2>::from_floats([[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]], &device);
        let dim = Dim::with_static_size("time", 3);

        let output = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new().with_spatial_dim(dim.clone()),
            Tensor::<TB, 1>::zeros([2], &device),
            xs,
            &[[2]],
            None,
            |acc, x: Tensor<TB, 1>| {
                let acc = acc + x;
                (acc.clone(), vec![acc])
            },
            &device,
        )
        .unwrap();

        assert_eq!(output.spatial_dim, dim);
        output
            .state
            .into_data()
            .assert_eq(&TensorData::from([9.0, 12.0]), false);
        output.ys[0].clone().into_data().assert_eq(
            &TensorData::from([[1.0, 2.0], [4.0, 6.0], [9.0, 12.0]]),
            false,
        );
    }

    #[test]
    fn known_dim_rejects_condition() {
        let device = Default::default();
        let mut cond = |_: &usize| flags([true, true]);

        let result = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new().with_spatial_dim(Dim::with_static_size("time", 2)),
            0usize,
            (),
            &[],
            Some(&mut cond),
            |i, ()| (i, vec![]),
            &device,
        );

        assert!(matches!(result, Err(LoopError::InvalidArguments(_))));
    }

    #[test]
    fn unknown_dim_requires_condition_and_no_inputs() {
        let device = Default::default();

        let missing_cond = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new(),
            0usize,
            (),
            &[],
            None,
            |i, ()| (i, vec![]),
            &device,
        );
        assert!(matches!(missing_cond, Err(LoopError::InvalidArguments(_))));

        let mut cond = |_: &usize| flags([true, true]);
        let with_inputs = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new(),
            0usize,
            Tensor::<TB, 2>::zeros([3, 2], &device),
            &[],
            Some(&mut cond),
            |i, _x| (i, vec![]),
            &device,
        );
        assert!(matches!(with_inputs, Err(LoopError::InvalidArguments(_))));
    }

    #[test]
    fn output_count_mismatch_is_reported() {
        let device = Default::default();
        let mut cond = |_: &usize| flags([true, true]);

        let result = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new().with_max_seq_len(3),
            0usize,
            (),
            &[[2]],
            Some(&mut cond),
            |i, ()| {
                let y = Tensor::zeros([2], &device);
                (i + 1, vec![y.clone(), y])
            },
            &device,
        );

        assert!(matches!(
            result,
            Err(LoopError::StructureMismatch { step: 0, .. })
        ));
    }

    #[test]
    fn graph_mode_fails_loudly() {
        let device = Default::default();
        let mut cond = |_: &usize| flags([true, true]);

        let result = scan::<TB, _, _, _, 1, 2>(
            ScanOptions::new()
                .with_max_seq_len(3)
                .with_mode(ExecutionMode::Graph),
            0usize,
            (),
            &[],
            Some(&mut cond),
            |i, ()| (i, vec![]),
            &device,
        );

        assert_eq!(
            result.err(),
            Some(LoopError::NotImplemented(ExecutionMode::Graph))
        );
    }
}
