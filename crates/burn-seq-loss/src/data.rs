//! Host side conversions used where a computation needs data dependent shapes.

use burn::tensor::{
    Bool, ElementConversion, Int, Tensor, TensorData,
    backend::Backend,
    ops::{FloatElem, IntElem},
};

pub(crate) fn float_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

pub(crate) fn int_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}

pub(crate) fn bool_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Bool>) -> Vec<bool> {
    tensor.into_data().iter::<bool>().collect()
}

pub(crate) fn float_tensor<B: Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let values = values
        .into_iter()
        .map(|v| v.elem::<FloatElem<B>>())
        .collect::<Vec<_>>();

    Tensor::from_data(TensorData::new(values, shape), device)
}

pub(crate) fn int_tensor<B: Backend, const D: usize>(
    values: Vec<i64>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D, Int> {
    let values = values
        .into_iter()
        .map(|v| v.elem::<IntElem<B>>())
        .collect::<Vec<_>>();

    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Number of valid frames per batch entry of a `[time, batch]` float mask.
pub(crate) fn lengths<B: Backend>(mask: Tensor<B, 2>) -> Vec<usize> {
    let [time, batch] = mask.dims();
    let values = float_values(mask);

    (0..batch)
        .map(|b| (0..time).filter(|t| values[t * batch + b] > 0.5).count())
        .collect()
}

/// Read a scalar out of a single element tensor.
pub(crate) fn scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f32 {
    tensor.into_data().iter::<f32>().next().unwrap_or(0.0)
}
