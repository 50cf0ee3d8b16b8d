use burn::tensor::{Bool, Int, Tensor, backend::Backend};

use crate::data::{bool_values, float_tensor, float_values, int_values};

/// Target of an output layer, time major.
#[derive(Debug, Clone)]
pub enum Target<B: Backend> {
    /// Class index per frame, `[time, batch]`.
    Labels(Tensor<B, 2, Int>),
    /// One-hot class per frame, `[time, batch, classes]`.
    OneHot(Tensor<B, 3, Int>),
    /// Continuous target per frame, `[time, batch, dim]`.
    Dense(Tensor<B, 3>),
    /// Weighted classes given as coordinates.
    Sparse(SparseTarget<B>),
    /// No target, the layer only scores.
    None,
}

impl<B: Backend> Target<B> {
    /// Short name of the target kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Labels(_) => "labels",
            Self::OneHot(_) => "one-hot",
            Self::Dense(_) => "dense",
            Self::Sparse(_) => "sparse",
            Self::None => "none",
        }
    }

    /// Number of frames, for time major targets.
    pub fn time(&self) -> Option<usize> {
        match self {
            Self::Labels(labels) => Some(labels.dims()[0]),
            Self::OneHot(one_hot) => Some(one_hot.dims()[0]),
            Self::Dense(dense) => Some(dense.dims()[0]),
            Self::Sparse(_) | Self::None => None,
        }
    }

    /// Append zero frames until the target spans `time` frames.
    pub fn pad_time(self, time: usize) -> Self {
        match self {
            Self::Labels(labels) => {
                let [t, batch] = labels.dims();
                if t >= time {
                    return Self::Labels(labels);
                }
                let padding = Tensor::zeros([time - t, batch], &labels.device());
                Self::Labels(Tensor::cat(vec![labels, padding], 0))
            }
            Self::OneHot(one_hot) => {
                let [t, batch, classes] = one_hot.dims();
                if t >= time {
                    return Self::OneHot(one_hot);
                }
                let padding = Tensor::zeros([time - t, batch, classes], &one_hot.device());
                Self::OneHot(Tensor::cat(vec![one_hot, padding], 0))
            }
            Self::Dense(dense) => {
                let [t, batch, dim] = dense.dims();
                if t >= time {
                    return Self::Dense(dense);
                }
                let padding = Tensor::zeros([time - t, batch, dim], &dense.device());
                Self::Dense(Tensor::cat(vec![dense, padding], 0))
            }
            other => other,
        }
    }

    /// Class labels `[time, batch]`, for label and one-hot targets.
    pub fn labels(&self) -> Option<Tensor<B, 2, Int>> {
        match self {
            Self::Labels(labels) => Some(labels.clone()),
            Self::OneHot(one_hot) => {
                let [time, batch, _] = one_hot.dims();
                Some(one_hot.clone().argmax(2).reshape([time, batch]))
            }
            _ => None,
        }
    }

    /// Flatten to rows aligned with the flattened logits of a `[time, batch, classes]` layer.
    ///
    /// Sparse targets flatten to the class of largest weight per frame.
    pub fn flatten(&self, time: usize, batch: usize, classes: usize) -> FlatTarget<B> {
        match self {
            Self::Labels(labels) => {
                let [t, b] = labels.dims();
                FlatTarget::Labels(labels.clone().reshape([t * b]))
            }
            Self::OneHot(one_hot) => {
                let [t, b, c] = one_hot.dims();
                FlatTarget::OneHot(one_hot.clone().reshape([t * b, c]))
            }
            Self::Dense(dense) => {
                let [t, b, d] = dense.dims();
                FlatTarget::Dense(dense.clone().reshape([t * b, d]))
            }
            Self::Sparse(sparse) => FlatTarget::Labels(
                sparse
                    .to_dense(time, classes)
                    .argmax(2)
                    .reshape([time * batch]),
            ),
            Self::None => FlatTarget::None,
        }
    }
}

/// Target distribution given as `(time, class, weight)` coordinates.
///
/// Every field is `[entries, batch]`; entries whose mask is `false` are padding.
#[derive(Debug, Clone)]
pub struct SparseTarget<B: Backend> {
    /// Frame of each entry.
    pub time: Tensor<B, 2, Int>,
    /// Class of each entry.
    pub class: Tensor<B, 2, Int>,
    /// Weight of each entry.
    pub weight: Tensor<B, 2>,
    /// Validity of each entry.
    pub mask: Tensor<B, 2, Bool>,
}

impl<B: Backend> SparseTarget<B> {
    /// Scatter the entries into a `[time, batch, classes]` tensor. Weights of repeated
    /// coordinates add up; entries outside the grid are dropped.
    pub fn to_dense(&self, time: usize, classes: usize) -> Tensor<B, 3> {
        let [entries, batch] = self.time.dims();
        let device = self.weight.device();
        let frames = int_values(self.time.clone());
        let class = int_values(self.class.clone());
        let weight = float_values(self.weight.clone());
        let mask = bool_values(self.mask.clone());

        let mut dense = vec![0.0; time * batch * classes];
        for k in 0..entries {
            for b in 0..batch {
                let i = k * batch + b;
                if !mask[i] || frames[i] < 0 || class[i] < 0 {
                    continue;
                }
                let (t, c) = (frames[i] as usize, class[i] as usize);
                if t < time && c < classes {
                    dense[(t * batch + b) * classes + c] += weight[i];
                }
            }
        }

        float_tensor(dense, [time, batch, classes], &device)
    }
}

/// A target flattened to `time * batch` rows.
#[derive(Debug, Clone)]
pub enum FlatTarget<B: Backend> {
    /// Class index per row.
    Labels(Tensor<B, 1, Int>),
    /// One-hot row.
    OneHot(Tensor<B, 2, Int>),
    /// Continuous row.
    Dense(Tensor<B, 2>),
    /// No target.
    None,
}

impl<B: Backend> FlatTarget<B> {
    /// Class index per row, for label and one-hot targets.
    pub fn labels(&self) -> Option<Tensor<B, 1, Int>> {
        match self {
            Self::Labels(labels) => Some(labels.clone()),
            Self::OneHot(one_hot) => {
                let [rows, _] = one_hot.dims();
                Some(one_hot.clone().argmax(1).reshape([rows]))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::TensorData;

    #[test]
    fn labels_pad_with_zero_frames() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[1, 2]], &device);

        let Target::Labels(padded) = Target::Labels(labels).pad_time(3) else {
            panic!("padding changed the target kind");
        };

        padded
            .into_data()
            .assert_eq(&TensorData::from([[1i64, 2], [0, 0], [0, 0]]), false);
    }

    #[test]
    fn sparse_target_scatters_valid_entries() {
        let device = Default::default();
        let sparse = SparseTarget::<TestBackend> {
            time: Tensor::from_ints([[0], [1], [1]], &device),
            class: Tensor::from_ints([[1], [0], [1]], &device),
            weight: Tensor::from_floats([[1.0], [0.25], [0.75]], &device),
            mask: Tensor::from_data(TensorData::from([[true], [true], [true]]), &device),
        };

        let dense = sparse.to_dense(2, 2);

        dense
            .into_data()
            .assert_eq(&TensorData::from([[[0.0, 1.0]], [[0.25, 0.75]]]), false);
    }

    #[test]
    fn sparse_target_flattens_to_heaviest_class() {
        let device = Default::default();
        let sparse = SparseTarget::<TestBackend> {
            time: Tensor::from_ints([[0], [1]], &device),
            class: Tensor::from_ints([[1], [2]], &device),
            weight: Tensor::from_floats([[1.0], [1.0]], &device),
            mask: Tensor::from_data(TensorData::from([[true], [false]]), &device),
        };

        let FlatTarget::Labels(labels) = Target::Sparse(sparse).flatten(2, 1, 3) else {
            panic!("sparse targets flatten to labels");
        };

        labels
            .into_data()
            .assert_eq(&TensorData::from([1i64, 0]), false);
    }
}
