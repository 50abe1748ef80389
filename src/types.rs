//! Closed enumerations shared with the convolution engine.
//!
//! Discriminants follow the engine's own constant ordering so that a value can
//! cross the driver boundary as a plain integer. `tests` at the bottom pin the
//! ordering down.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest tensor rank the engine accepts.
pub const DIM_MAX: usize = 8;

/// Numeric element kind of a tensor, filter or convolution compute type.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Float = 0,
    Double = 1,
    Half = 2,
    Int8 = 3,
    Int32 = 4,
    Int8x4 = 5,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Float,
        DataType::Double,
        DataType::Half,
        DataType::Int8,
        DataType::Int32,
        DataType::Int8x4,
    ];

    /// Storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::Float => 4,
            Self::Double => 8,
            Self::Half => 2,
            Self::Int8 => 1,
            Self::Int32 => 4,
            Self::Int8x4 => 4,
        }
    }

    /// Whether values of this kind are floating point.
    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double | Self::Half)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "DATA_FLOAT",
            Self::Double => "DATA_DOUBLE",
            Self::Half => "DATA_HALF",
            Self::Int8 => "DATA_INT8",
            Self::Int32 => "DATA_INT32",
            Self::Int8x4 => "DATA_INT8x4",
        }
    }

    pub fn from_raw(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as i32 == value)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory layout tag of a 4-d tensor or a filter.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TensorFormat {
    #[default]
    Nchw = 0,
    Nhwc = 1,
    NchwVectC = 2,
}

impl TensorFormat {
    pub const ALL: [TensorFormat; 3] = [Self::Nchw, Self::Nhwc, Self::NchwVectC];

    pub fn name(self) -> &'static str {
        match self {
            Self::Nchw => "TENSOR_NCHW",
            Self::Nhwc => "TENSOR_NHWC",
            Self::NchwVectC => "TENSOR_NCHW_VECT_C",
        }
    }
}

impl fmt::Display for TensorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the filter is flipped (true convolution) or applied as is.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvolutionMode {
    #[default]
    Convolution = 0,
    CrossCorrelation = 1,
}

impl ConvolutionMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Convolution => "CONVOLUTION",
            Self::CrossCorrelation => "CROSS_CORRELATION",
        }
    }
}

/// Accumulation mode. Tensor-op math permits reduced-precision accumulation.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MathType {
    #[default]
    #[serde(rename = "DEFAULT_MATH")]
    Default = 0,
    #[serde(rename = "TENSOR_OP_MATH")]
    TensorOp = 1,
}

impl MathType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT_MATH",
            Self::TensorOp => "TENSOR_OP_MATH",
        }
    }
}

/// Which tensor a convolution call solves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Forward,
    BackwardData,
    BackwardFilter,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Self::Forward, Self::BackwardData, Self::BackwardFilter];

    pub fn name(self) -> &'static str {
        match self {
            Self::Forward => "CONVOLUTION_FWD",
            Self::BackwardData => "CONVOLUTION_BWD_DATA",
            Self::BackwardFilter => "CONVOLUTION_BWD_FILTER",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
