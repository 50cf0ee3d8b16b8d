use burn::tensor::{Bool, Tensor, backend::Backend};

use crate::sequence_mask;

/// A named spatial axis.
///
/// A dim can carry a static size, per batch entry dynamic sizes, or neither. A dim with neither
/// is *unknown*: its length is only discovered by running a loop over it, see
/// [scan](crate::scan).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    name: String,
    static_size: Option<usize>,
    dyn_size: Option<Vec<usize>>,
}

impl Dim {
    /// Create a dim whose length is not known yet.
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            static_size: None,
            dyn_size: None,
        }
    }

    /// Create a dim with the same length for every batch entry.
    pub fn with_static_size(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            static_size: Some(size),
            dyn_size: None,
        }
    }

    /// Create a dim with one length per batch entry.
    pub fn with_dyn_size(name: impl Into<String>, sizes: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            static_size: None,
            dyn_size: Some(sizes),
        }
    }

    /// The name of the dim.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the length of the dim is known, either statically or per batch entry.
    pub fn is_dim_known(&self) -> bool {
        self.static_size.is_some() || self.dyn_size.is_some()
    }

    /// Whether the dim has per batch entry lengths.
    pub fn is_dynamic(&self) -> bool {
        self.dyn_size.is_some()
    }

    /// The static size, if any.
    pub fn static_size(&self) -> Option<usize> {
        self.static_size
    }

    /// The per batch entry lengths, if any.
    pub fn dyn_size(&self) -> Option<&[usize]> {
        self.dyn_size.as_deref()
    }

    /// Record the realized per batch entry lengths.
    pub fn set_dyn_size(&mut self, sizes: Vec<usize>) {
        log::debug!("Dim {} realized lengths {:?}", self.name, sizes);
        self.dyn_size = Some(sizes);
    }

    /// The padded length of the axis: the static size, or the largest dynamic size.
    pub fn max_size(&self) -> Option<usize> {
        match (&self.static_size, &self.dyn_size) {
            (Some(size), _) => Some(*size),
            (None, Some(sizes)) => Some(sizes.iter().copied().max().unwrap_or(0)),
            (None, None) => None,
        }
    }

    /// Validity mask of shape `[max_size, batch]`, `true` for frames within the length of their
    /// batch entry. `None` if the dim has no dynamic sizes.
    pub fn time_major_mask<B: Backend>(&self, device: &B::Device) -> Option<Tensor<B, 2, Bool>> {
        let sizes = self.dyn_size.as_ref()?;
        let max_len = self.max_size().unwrap_or(0);

        sequence_mask::<B, 2>([max_len, sizes.len()], 0, Some(1), sizes, device).ok()
    }
}
