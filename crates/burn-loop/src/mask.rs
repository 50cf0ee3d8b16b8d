use burn::tensor::{Bool, Shape, Tensor, TensorData, backend::Backend};

use crate::LoopError;

/// Build a validity mask of the given shape from per batch entry lengths.
///
/// Position `p` is valid when `p[axis] < lengths[p[batch_axis]]`. Without a batch axis a single
/// length applies to the whole tensor.
pub fn sequence_mask<B: Backend, const D: usize>(
    shape: [usize; D],
    axis: usize,
    batch_axis: Option<usize>,
    lengths: &[usize],
    device: &B::Device,
) -> Result<Tensor<B, D, Bool>, LoopError> {
    if axis >= D {
        return Err(LoopError::Axis(format!(
            "time axis {axis} out of range for rank {D}"
        )));
    }
    match batch_axis {
        Some(batch_axis) if batch_axis >= D || batch_axis == axis => {
            return Err(LoopError::Axis(format!(
                "batch axis {batch_axis} invalid for time axis {axis} and rank {D}"
            )));
        }
        Some(batch_axis) if lengths.len() != shape[batch_axis] => {
            return Err(LoopError::InvalidArguments(format!(
                "{} lengths given for a batch of {}",
                lengths.len(),
                shape[batch_axis]
            )));
        }
        None if lengths.len() != 1 => {
            return Err(LoopError::InvalidArguments(format!(
                "{} lengths given without a batch axis",
                lengths.len()
            )));
        }
        _ => {}
    }

    let mut strides = [1; D];
    for i in (0..D.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }

    let num_elements = shape.iter().product::<usize>();
    let values = (0..num_elements)
        .map(|flat| {
            let pos = (flat / strides[axis]) % shape[axis];
            let length = match batch_axis {
                Some(batch_axis) => lengths[(flat / strides[batch_axis]) % shape[batch_axis]],
                None => lengths[0],
            };
            pos < length
        })
        .collect::<Vec<_>>();

    Ok(Tensor::from_data(
        TensorData::new(values, Shape::new(shape)),
        device,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    #[test]
    fn batch_major_mask() {
        let device = Default::default();

        let mask =
            sequence_mask::<TestBackend, 2>([2, 3], 1, Some(0), &[1, 3], &device).unwrap();

        mask.into_data().assert_eq(
            &TensorData::from([[true, false, false], [true, true, true]]),
            false,
        );
    }

    #[test]
    fn mask_broadcasts_over_feature_axes() {
        let device = Default::default();

        let mask =
            sequence_mask::<TestBackend, 3>([2, 2, 2], 0, Some(1), &[1, 2], &device).unwrap();

        mask.into_data().assert_eq(
            &TensorData::from([
                [[true, true], [true, true]],
                [[false, false], [true, true]],
            ]),
            false,
        );
    }

    #[test]
    fn length_count_must_match_batch() {
        let device = Default::default();

        let result = sequence_mask::<TestBackend, 2>([2, 3], 0, Some(1), &[1, 2], &device);

        assert!(matches!(result, Err(LoopError::InvalidArguments(_))));
    }
}
