use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for size checks on tensor copy APIs.
pub type Result<T> = std::result::Result<T, SizeMismatchErr>;

/// Error returned by tensor copy methods whenever an external buffer does
/// not match the tensor's element layout.
#[derive(Debug)]
pub struct SizeMismatchErr;

impl Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tensor error: the provided buffer length doesn't match the tensor layout")
    }
}

impl Error for SizeMismatchErr {}
