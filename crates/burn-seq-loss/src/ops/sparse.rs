use burn::tensor::{Tensor, activation, backend::Backend};

/// Cross-entropy of logits rows `[rows, classes]` against weighted class targets of the same
/// shape, with its gradient w.r.t. the logits.
///
/// Returns the per row loss `-sum(q * log_softmax(z))` and the gradient
/// `softmax(z) * sum(q) - q`, both zero on rows where `mask` is `0`.
pub fn sparse_softmax_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    mask: Tensor<B, 1>,
) -> (Tensor<B, 1>, Tensor<B, 2>) {
    let [rows, _] = logits.dims();
    let mask = mask.reshape([rows, 1]);
    let weight = targets.clone().sum_dim(1);

    let loss = activation::log_softmax(logits.clone(), 1)
        .mul(targets.clone())
        .sum_dim(1)
        .neg()
        .mul(mask.clone())
        .reshape([rows]);
    let grad = activation::softmax(logits.detach(), 1)
        .mul(weight)
        .sub(targets)
        .mul(mask);

    (loss, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{TensorData, Tolerance, ops::FloatElem};

    type FT = FloatElem<TestBackend>;

    #[test]
    fn gradient_is_softmax_minus_target() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [5.0, 1.0]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[0.25, 0.75], [1.0, 0.0]], &device);
        let mask = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0], &device);

        let (loss, grad) = sparse_softmax_cross_entropy(logits, targets, mask);

        loss.into_data().assert_approx_eq::<FT>(
            &TensorData::from([-(0.5f32.ln()), 0.0]),
            Tolerance::default(),
        );
        grad.into_data().assert_approx_eq::<FT>(
            &TensorData::from([[0.25, -0.25], [0.0, 0.0]]),
            Tolerance::default(),
        );
    }
}
