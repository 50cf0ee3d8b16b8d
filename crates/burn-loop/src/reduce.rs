use burn::tensor::{BasicOps, Bool, Int, Tensor, TensorKind, backend::Backend};

use crate::{Dim, LoopError, sequence_mask};

/// Reduction applied by [reduce].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceMode {
    /// Sum of the elements.
    Sum,
    /// Maximum element.
    Max,
    /// Minimum element.
    Min,
    /// Arithmetic mean.
    Mean,
    /// `log(sum(exp(x)))`, computed stably.
    LogSumExp,
    /// Whether any element is non-zero.
    Any,
    /// Whether all elements are non-zero.
    All,
    /// Position of the minimum.
    ArgMin,
    /// Position of the maximum.
    ArgMax,
}

impl core::str::FromStr for ReduceMode {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sum" => Self::Sum,
            "max" => Self::Max,
            "min" => Self::Min,
            "mean" => Self::Mean,
            "logsumexp" => Self::LogSumExp,
            "any" => Self::Any,
            "all" => Self::All,
            "argmin" => Self::ArgMin,
            "argmax" => Self::ArgMax,
            other => {
                return Err(LoopError::InvalidArguments(format!(
                    "unknown reduce mode {other:?}"
                )));
            }
        })
    }
}

/// An axis to reduce over.
#[derive(Debug, Clone, Copy)]
pub struct ReduceAxis<'a> {
    /// Position of the axis in the source tensor.
    pub axis: usize,
    /// Dim describing the axis. Its dynamic sizes drive the time mask.
    pub dim: Option<&'a Dim>,
    /// Axis of the source tensor the dynamic sizes are indexed by.
    pub batch_axis: Option<usize>,
}

impl<'a> ReduceAxis<'a> {
    /// An axis without padding information.
    pub fn new(axis: usize) -> Self {
        Self {
            axis,
            dim: None,
            batch_axis: None,
        }
    }

    /// An axis whose padding is described by `dim`, with lengths indexed along `batch_axis`.
    pub fn masked(axis: usize, dim: &'a Dim, batch_axis: usize) -> Self {
        Self {
            axis,
            dim: Some(dim),
            batch_axis: Some(batch_axis),
        }
    }
}

/// Output of [reduce]; the element kind depends on the mode.
#[derive(Debug, Clone)]
pub enum Reduced<B: Backend, const D: usize> {
    /// Sum, max, min, mean and logsumexp.
    Float(Tensor<B, D>),
    /// Argmin and argmax.
    Int(Tensor<B, D, Int>),
    /// Any and all.
    Bool(Tensor<B, D, Bool>),
}

impl<B: Backend, const D: usize> Reduced<B, D> {
    /// The float result.
    pub fn into_float(self) -> Result<Tensor<B, D>, LoopError> {
        match self {
            Self::Float(tensor) => Ok(tensor),
            other => Err(LoopError::InvalidArguments(format!(
                "expected a float reduction, got {}",
                other.kind()
            ))),
        }
    }

    /// The index result.
    pub fn into_int(self) -> Result<Tensor<B, D, Int>, LoopError> {
        match self {
            Self::Int(tensor) => Ok(tensor),
            other => Err(LoopError::InvalidArguments(format!(
                "expected an index reduction, got {}",
                other.kind()
            ))),
        }
    }

    /// The boolean result.
    pub fn into_bool(self) -> Result<Tensor<B, D, Bool>, LoopError> {
        match self {
            Self::Bool(tensor) => Ok(tensor),
            other => Err(LoopError::InvalidArguments(format!(
                "expected a boolean reduction, got {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
        }
    }
}

/// Reduce `source` over `axes`, removing them from the result.
///
/// With `use_time_mask`, positions beyond the dynamic length of an axis' dim do not take part:
/// they count as `0` for sums, are excluded from the mean's count, as `-inf` for max, argmax and
/// logsumexp, as `+inf` for min and argmin, as `false` for any and as `true` for all.
///
/// `D2` must be `D` minus the number of axes; reducing every axis yields a tensor of shape `[1]`.
/// Arg reductions take exactly one axis.
pub fn reduce<B: Backend, const D: usize, const D2: usize>(
    source: Tensor<B, D>,
    mode: ReduceMode,
    axes: &[ReduceAxis<'_>],
    use_time_mask: bool,
) -> Result<Reduced<B, D2>, LoopError> {
    let axis_ids = check_axes::<D, D2>(axes)?;
    let valid = if use_time_mask {
        valid_mask(&source, axes)?
    } else {
        None
    };
    let invalid = valid.clone().map(|valid| valid.bool_not());

    let reduced = match mode {
        ReduceMode::Sum => {
            let source = match invalid {
                Some(invalid) => source.mask_fill(invalid, 0.0),
                None => source,
            };
            Reduced::Float(drop_axes(sum_axes(source, &axis_ids), &axis_ids))
        }
        ReduceMode::Mean => {
            let dims = source.dims();
            let (source, count) = match (valid, invalid) {
                (Some(valid), Some(invalid)) => {
                    let count = sum_axes(valid.float(), &axis_ids).clamp_min(1.0);
                    (source.mask_fill(invalid, 0.0), Some(count))
                }
                _ => (source, None),
            };
            let sum = sum_axes(source, &axis_ids);
            let mean = match count {
                Some(count) => sum.div(count),
                None => sum.div_scalar(axis_ids.iter().map(|a| dims[*a]).product::<usize>() as f32),
            };
            Reduced::Float(drop_axes(mean, &axis_ids))
        }
        ReduceMode::Max | ReduceMode::LogSumExp => {
            let source = match invalid {
                Some(invalid) => source.mask_fill(invalid, f32::NEG_INFINITY),
                None => source,
            };
            let max = axis_ids
                .iter()
                .fold(source.clone(), |acc, axis| acc.max_dim(*axis));
            if mode == ReduceMode::Max {
                Reduced::Float(drop_axes(max, &axis_ids))
            } else {
                // A fully masked slice has max -inf, shift by zero there to avoid NaN.
                let shift = max.clone().mask_fill(max.lower_elem(f32::MIN), 0.0);
                let sum_exp = sum_axes(source.sub(shift.clone()).exp(), &axis_ids);
                Reduced::Float(drop_axes(sum_exp.log().add(shift), &axis_ids))
            }
        }
        ReduceMode::Min => {
            let source = match invalid {
                Some(invalid) => source.mask_fill(invalid, f32::INFINITY),
                None => source,
            };
            let min = axis_ids
                .iter()
                .fold(source, |acc, axis| acc.min_dim(*axis));
            Reduced::Float(drop_axes(min, &axis_ids))
        }
        ReduceMode::ArgMax | ReduceMode::ArgMin => {
            let [axis] = axis_ids.as_slice() else {
                return Err(LoopError::Axis(format!(
                    "{mode:?} reduces exactly one axis, got {}",
                    axis_ids.len()
                )));
            };
            let indices = match (mode, invalid) {
                (ReduceMode::ArgMax, Some(invalid)) => {
                    source.mask_fill(invalid, f32::NEG_INFINITY).argmax(*axis)
                }
                (ReduceMode::ArgMax, None) => source.argmax(*axis),
                (_, Some(invalid)) => source.mask_fill(invalid, f32::INFINITY).argmin(*axis),
                (_, None) => source.argmin(*axis),
            };
            Reduced::Int(drop_axes(indices, &axis_ids))
        }
        ReduceMode::Any => {
            let nonzero = source.equal_elem(0.0).bool_not().float();
            let nonzero = match valid {
                Some(valid) => nonzero.mul(valid.float()),
                None => nonzero,
            };
            let any = sum_axes(nonzero, &axis_ids).greater_elem(0.0);
            Reduced::Bool(drop_axes(any, &axis_ids))
        }
        ReduceMode::All => {
            let nonzero = source.equal_elem(0.0).bool_not().float();
            let nonzero = match invalid {
                Some(invalid) => nonzero.mask_fill(invalid, 1.0),
                None => nonzero,
            };
            let all = axis_ids
                .iter()
                .fold(nonzero, |acc, axis| acc.min_dim(*axis))
                .greater_elem(0.5);
            Reduced::Bool(drop_axes(all, &axis_ids))
        }
    };

    Ok(reduced)
}

macro_rules! reduce_fn {
    ($(#[$doc:meta])* $name:ident, $mode:expr, $kind:ty, $into:ident) => {
        $(#[$doc])*
        pub fn $name<B: Backend, const D: usize, const D2: usize>(
            source: Tensor<B, D>,
            axes: &[ReduceAxis<'_>],
            use_time_mask: bool,
        ) -> Result<Tensor<B, D2, $kind>, LoopError> {
            reduce::<B, D, D2>(source, $mode, axes, use_time_mask)?.$into()
        }
    };
}

reduce_fn!(
    /// Masked sum, see [reduce].
    reduce_sum, ReduceMode::Sum, burn::tensor::Float, into_float
);
reduce_fn!(
    /// Masked maximum, see [reduce].
    reduce_max, ReduceMode::Max, burn::tensor::Float, into_float
);
reduce_fn!(
    /// Masked minimum, see [reduce].
    reduce_min, ReduceMode::Min, burn::tensor::Float, into_float
);
reduce_fn!(
    /// Masked mean, see [reduce].
    reduce_mean, ReduceMode::Mean, burn::tensor::Float, into_float
);
reduce_fn!(
    /// Masked log-sum-exp, see [reduce].
    reduce_logsumexp, ReduceMode::LogSumExp, burn::tensor::Float, into_float
);
reduce_fn!(
    /// Masked any, see [reduce].
    reduce_any, ReduceMode::Any, Bool, into_bool
);
reduce_fn!(
    /// Masked all, see [reduce].
    reduce_all, ReduceMode::All, Bool, into_bool
);
reduce_fn!(
    /// Masked argmin, see [reduce].
    reduce_argmin, ReduceMode::ArgMin, Int, into_int
);
reduce_fn!(
    /// Masked argmax, see [reduce].
    reduce_argmax, ReduceMode::ArgMax, Int, into_int
);

fn check_axes<const D: usize, const D2: usize>(
    axes: &[ReduceAxis<'_>],
) -> Result<Vec<usize>, LoopError> {
    if axes.is_empty() {
        return Err(LoopError::Axis("no axis to reduce".into()));
    }
    let mut ids = Vec::with_capacity(axes.len());
    for axis in axes {
        if axis.axis >= D {
            return Err(LoopError::Axis(format!(
                "axis {} out of range for rank {D}",
                axis.axis
            )));
        }
        if ids.contains(&axis.axis) {
            return Err(LoopError::Axis(format!("axis {} given twice", axis.axis)));
        }
        ids.push(axis.axis);
    }

    let expected = (D - ids.len()).max(1);
    if D2 != expected {
        return Err(LoopError::Axis(format!(
            "reducing {} axes of a rank {D} tensor yields rank {expected}, not {D2}",
            ids.len()
        )));
    }

    Ok(ids)
}

fn valid_mask<B: Backend, const D: usize>(
    source: &Tensor<B, D>,
    axes: &[ReduceAxis<'_>],
) -> Result<Option<Tensor<B, D, Bool>>, LoopError> {
    let shape = source.dims();
    let device = source.device();
    let mut valid: Option<Tensor<B, D>> = None;

    for axis in axes {
        let Some(lengths) = axis.dim.and_then(|dim| dim.dyn_size()) else {
            continue;
        };
        let mask = sequence_mask::<B, D>(shape, axis.axis, axis.batch_axis, lengths, &device)?
            .float();
        valid = Some(match valid {
            Some(valid) => valid.mul(mask),
            None => mask,
        });
    }

    Ok(valid.map(|valid| valid.greater_elem(0.5)))
}

fn sum_axes<B: Backend, const D: usize>(tensor: Tensor<B, D>, axes: &[usize]) -> Tensor<B, D> {
    axes.iter().fold(tensor, |acc, axis| acc.sum_dim(*axis))
}

fn drop_axes<B, K, const D: usize, const D2: usize>(
    tensor: Tensor<B, D, K>,
    axes: &[usize],
) -> Tensor<B, D2, K>
where
    B: Backend,
    K: TensorKind<B> + BasicOps<B>,
{
    let dims = tensor.dims();
    let mut shape = [1; D2];
    let kept = (0..D).filter(|axis| !axes.contains(axis)).map(|axis| dims[axis]);
    for (slot, size) in shape.iter_mut().zip(kept) {
        *slot = size;
    }

    tensor.reshape(shape)
}
