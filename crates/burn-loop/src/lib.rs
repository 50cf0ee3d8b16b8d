#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Loop and reduction primitives over Burn tensors.
//!
//! - [while_loop] runs a host loop over an arbitrary state on eager backends.
//! - [scan] iterates over a known axis, or until a per batch entry condition fails, and stacks
//!   the per step outputs collected in [TensorArray]s.
//! - [reduce] and its wrappers reduce over axes while ignoring padding described by a [Dim].

mod dim;
mod error;
mod mask;
mod reduce;
mod scan;
mod tensor_array;
mod while_loop;

pub use dim::*;
pub use error::*;
pub use mask::*;
pub use reduce::*;
pub use scan::*;
pub use tensor_array::*;
pub use while_loop::*;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;
