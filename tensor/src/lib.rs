mod dtype;
pub mod engine;
mod error;
mod tensor;

pub use dtype::Dtype;
pub use error::{Result, SizeMismatchErr};
pub use tensor::{Layout, Tensor};
