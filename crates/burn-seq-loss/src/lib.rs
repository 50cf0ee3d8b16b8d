#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Output layers and their training criteria.
//!
//! An output layer projects its sources to class scores, reconciles them with the target and
//! its index, and computes a [Cost]: the loss and, where a criterion supplies them, the
//! [known gradients](KnownGrads) that replace automatic differentiation.
//!
//! - [layer::FramewiseOutputLayer] scores every frame on its own (`ce`, `entropy`, `priori`,
//!   `sse`).
//! - [layer::SequenceOutputLayer] trains with sequence criteria (`ctc`, `ce_ctc`, `ctc2`,
//!   `sprint`, `fast_bw`, `viterbi`) on top of the [operators](ops).
//! - [layer::DecoderOutputLayer] and [layer::UnsupervisedOutputLayer] cover decoder sources and
//!   EM style training.
//!
//! Layers are built from an [OutputLayerConfig].

mod config;
mod data;
mod error;
mod grads;
mod priors;
mod target;

pub mod functional;
/// Output layers.
pub mod layer;
pub mod ops;

pub use config::*;
pub use error::*;
pub use grads::*;
pub use priors::*;
pub use target::*;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
