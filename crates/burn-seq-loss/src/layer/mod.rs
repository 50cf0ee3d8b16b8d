mod base;
mod decoder;
mod framewise;
mod sequence;
mod unsupervised;

pub use base::*;
pub use decoder::*;
pub use framewise::*;
pub use sequence::*;
pub use unsupervised::*;
