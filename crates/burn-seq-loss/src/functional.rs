//! Tensor helpers shared by the output layers.
//!
//! Rows are flattened `(time, batch)` frames; a float mask holds `1` for valid rows and `0`
//! for padding.

use burn::tensor::{Int, Tensor, activation, backend::Backend};

/// Reshape `[time, batch, dim]` into `[time * batch, dim]`.
pub fn flatten_time_batch<B: Backend>(tensor: Tensor<B, 3>) -> Tensor<B, 2> {
    let [time, batch, dim] = tensor.dims();
    tensor.reshape([time * batch, dim])
}

/// One-hot rows of `num_classes` columns. Labels outside `[0, num_classes)` give zero rows.
pub fn one_hot<B: Backend>(labels: Tensor<B, 1, Int>, num_classes: usize) -> Tensor<B, 2> {
    let [rows] = labels.dims();
    let device = labels.device();
    let classes = Tensor::<B, 1, Int>::arange(0..num_classes as i64, &device)
        .reshape([1, num_classes])
        .repeat_dim(0, rows);

    labels
        .reshape([rows, 1])
        .repeat_dim(1, num_classes)
        .equal(classes)
        .float()
}

/// Negative log-likelihood of `labels` under `softmax(logits)`, per row.
///
/// Masked rows are exactly zero, whatever their label or logits.
pub fn masked_nll<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    mask: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let [rows, classes] = logits.dims();
    let log_probs = activation::log_softmax(logits, 1);
    let nll = log_probs
        .mul(one_hot(labels, classes))
        .sum_dim(1)
        .reshape([rows])
        .neg();

    nll.mask_fill(mask.lower_elem(0.5), 0.0)
}

/// Cross-entropy of dense target rows against the probability rows `probs`, clipped to
/// `[1e-38, 1e20]` before the log. Masked rows are zero.
pub fn masked_dense_nll<B: Backend>(
    probs: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    mask: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let [rows, _] = probs.dims();
    let nll = probs
        .clamp(1e-38, 1e20)
        .log()
        .mul(targets)
        .sum_dim(1)
        .reshape([rows])
        .neg();

    nll.mask_fill(mask.lower_elem(0.5), 0.0)
}

/// Arg-max class of each row.
pub fn argmax_rows<B: Backend>(tensor: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    let [rows, _] = tensor.dims();
    tensor.argmax(1).reshape([rows])
}

/// Number of valid rows whose prediction differs from the label, as a single element tensor.
pub fn mismatches<B: Backend>(
    predictions: Tensor<B, 1, Int>,
    labels: Tensor<B, 1, Int>,
    mask: Tensor<B, 1>,
) -> Tensor<B, 1> {
    predictions
        .equal(labels)
        .bool_not()
        .float()
        .mul(mask)
        .sum()
}

/// Sum of the valid rows, `[rows, dim]` to `[dim]`.
pub fn masked_row_sum<B: Backend>(tensor: Tensor<B, 2>, mask: Tensor<B, 1>) -> Tensor<B, 1> {
    let [rows, dim] = tensor.dims();
    tensor
        .mul(mask.reshape([rows, 1]))
        .sum_dim(0)
        .reshape([dim])
}

/// Mean of the valid rows, `[rows, dim]` to `[dim]`.
pub fn masked_row_mean<B: Backend>(tensor: Tensor<B, 2>, mask: Tensor<B, 1>) -> Tensor<B, 1> {
    let count = mask.clone().sum().clamp_min(1.0);
    masked_row_sum(tensor, mask).div(count)
}
