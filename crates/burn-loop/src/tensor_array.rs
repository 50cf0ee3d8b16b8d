use burn::tensor::{Shape, Tensor, TensorData, backend::Backend};

use crate::LoopError;

/// Append-only accumulator of per step tensors sharing one shape.
///
/// Every pushed tensor must have the template shape. The array is consumed by
/// [stack](TensorArray::stack), which adds a new axis indexing the steps.
#[derive(Debug)]
pub struct TensorArray<B: Backend, const D: usize> {
    template: [usize; D],
    items: Vec<Tensor<B, D>>,
    device: B::Device,
}

impl<B: Backend, const D: usize> TensorArray<B, D> {
    /// Create an empty array accepting tensors of the template shape.
    pub fn new(template: [usize; D], device: &B::Device) -> Self {
        Self {
            template,
            items: Vec::new(),
            device: device.clone(),
        }
    }

    /// The shape every element must have.
    pub fn template(&self) -> [usize; D] {
        self.template
    }

    /// Number of pushed elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing was pushed yet.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append one element.
    pub fn push_back(mut self, item: Tensor<B, D>) -> Result<Self, LoopError> {
        let dims = item.dims();
        if dims != self.template {
            return Err(LoopError::StructureMismatch {
                step: self.items.len(),
                reason: format!(
                    "expected an element of shape {:?}, got {:?}",
                    self.template, dims
                ),
            });
        }
        self.items.push(item);

        Ok(self)
    }

    /// Stack all elements along a new axis `axis` of a `D2 = D + 1` rank tensor.
    ///
    /// An empty array stacks into a tensor with a zero sized `axis`.
    pub fn stack<const D2: usize>(self, axis: usize) -> Result<Tensor<B, D2>, LoopError> {
        if D2 != D + 1 {
            return Err(LoopError::InvalidArguments(format!(
                "stacking rank {D} elements yields rank {}, not {D2}",
                D + 1
            )));
        }
        if axis > D {
            return Err(LoopError::Axis(format!(
                "cannot insert axis {axis} into rank {D}"
            )));
        }

        if self.items.is_empty() {
            let mut dims = [0; D2];
            for (i, dim) in dims.iter_mut().enumerate() {
                *dim = match i.cmp(&axis) {
                    core::cmp::Ordering::Less => self.template[i],
                    core::cmp::Ordering::Equal => 0,
                    core::cmp::Ordering::Greater => self.template[i - 1],
                };
            }
            let data = TensorData::new(Vec::<f32>::new(), Shape::new(dims));
            return Ok(Tensor::from_data(data, &self.device));
        }

        Ok(Tensor::stack::<D2>(self.items, axis))
    }
}
