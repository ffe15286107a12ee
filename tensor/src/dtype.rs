/// Element type of a tensor. The discriminants are wire-visible: they are
/// the dtype half of the paired data-channel opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    Float32 = 0,
    Float64 = 1,
    Float16 = 2,
    Uint8 = 3,
    Int32 = 4,
    Int8 = 5,
    Int64 = 6,
}

impl Dtype {
    /// Decodes a numeric dtype code.
    ///
    /// # Panics
    /// If `code` is not a known dtype, which indicates a version mismatch
    /// between worker and server.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Dtype::Float32,
            1 => Dtype::Float64,
            2 => Dtype::Float16,
            3 => Dtype::Uint8,
            4 => Dtype::Int32,
            5 => Dtype::Int8,
            6 => Dtype::Int64,
            other => panic!("unknown dtype code {other}"),
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Float64 | Dtype::Int64 => 8,
            Dtype::Float16 => 2,
            Dtype::Uint8 | Dtype::Int8 => 1,
        }
    }

    /// Whether elementwise arithmetic is defined for this dtype. The
    /// remaining dtypes are storage-only.
    pub fn is_real(self) -> bool {
        matches!(self, Dtype::Float32 | Dtype::Float64 | Dtype::Float16)
    }
}
