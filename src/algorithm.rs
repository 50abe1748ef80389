//! Algorithm catalog.
//!
//! Each convolution direction has a fixed, engine-defined set of algorithm
//! identifiers. [`ConvolutionAlgo`] is the closed sum over the three sets; every
//! use site matches on it exhaustively.

use std::fmt;

use crate::types::Direction;

macro_rules! algorithm_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident = $index:literal => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[repr(i32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant = $index,)+
        }

        impl $name {
            /// Every identifier, in ascending numeric order.
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];
            /// Number of identifiers the engine defines for this direction.
            pub const COUNT: usize = Self::ALL.len();

            pub fn index(self) -> usize {
                self as usize
            }

            pub fn from_index(index: usize) -> Option<Self> {
                Self::ALL.get(index).copied()
            }

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

algorithm_enum! {
    /// Forward convolution algorithms.
    FwdAlgo {
        ImplicitGemm = 0 => "CONVOLUTION_FWD_ALGO_IMPLICIT_GEMM",
        ImplicitPrecompGemm = 1 => "CONVOLUTION_FWD_ALGO_IMPLICIT_PRECOMP_GEMM",
        Gemm = 2 => "CONVOLUTION_FWD_ALGO_GEMM",
        Direct = 3 => "CONVOLUTION_FWD_ALGO_DIRECT",
        Fft = 4 => "CONVOLUTION_FWD_ALGO_FFT",
        FftTiling = 5 => "CONVOLUTION_FWD_ALGO_FFT_TILING",
        Winograd = 6 => "CONVOLUTION_FWD_ALGO_WINOGRAD",
        WinogradNonfused = 7 => "CONVOLUTION_FWD_ALGO_WINOGRAD_NONFUSED",
    }
}

algorithm_enum! {
    /// Backward-data convolution algorithms.
    BwdDataAlgo {
        Algo0 = 0 => "CONVOLUTION_BWD_DATA_ALGO_0",
        Algo1 = 1 => "CONVOLUTION_BWD_DATA_ALGO_1",
        Fft = 2 => "CONVOLUTION_BWD_DATA_ALGO_FFT",
        FftTiling = 3 => "CONVOLUTION_BWD_DATA_ALGO_FFT_TILING",
        Winograd = 4 => "CONVOLUTION_BWD_DATA_ALGO_WINOGRAD",
        WinogradNonfused = 5 => "CONVOLUTION_BWD_DATA_ALGO_WINOGRAD_NONFUSED",
    }
}

algorithm_enum! {
    /// Backward-filter convolution algorithms.
    BwdFilterAlgo {
        Algo0 = 0 => "CONVOLUTION_BWD_FILTER_ALGO_0",
        Algo1 = 1 => "CONVOLUTION_BWD_FILTER_ALGO_1",
        Fft = 2 => "CONVOLUTION_BWD_FILTER_ALGO_FFT",
        Algo3 = 3 => "CONVOLUTION_BWD_FILTER_ALGO_3",
        Winograd = 4 => "CONVOLUTION_BWD_FILTER_ALGO_WINOGRAD",
        WinogradNonfused = 5 => "CONVOLUTION_BWD_FILTER_ALGO_WINOGRAD_NONFUSED",
        FftTiling = 6 => "CONVOLUTION_BWD_FILTER_ALGO_FFT_TILING",
    }
}

/// A direction-tagged algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvolutionAlgo {
    Forward(FwdAlgo),
    BackwardData(BwdDataAlgo),
    BackwardFilter(BwdFilterAlgo),
}

impl ConvolutionAlgo {
    pub fn direction(self) -> Direction {
        match self {
            Self::Forward(_) => Direction::Forward,
            Self::BackwardData(_) => Direction::BackwardData,
            Self::BackwardFilter(_) => Direction::BackwardFilter,
        }
    }

    /// Numeric value within the direction's identifier space.
    pub fn index(self) -> usize {
        match self {
            Self::Forward(algo) => algo.index(),
            Self::BackwardData(algo) => algo.index(),
            Self::BackwardFilter(algo) => algo.index(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Forward(algo) => algo.name(),
            Self::BackwardData(algo) => algo.name(),
            Self::BackwardFilter(algo) => algo.name(),
        }
    }

    /// The identifier with numeric value `index` in `direction`'s space.
    pub fn from_index(direction: Direction, index: usize) -> Option<Self> {
        match direction {
            Direction::Forward => FwdAlgo::from_index(index).map(Self::Forward),
            Direction::BackwardData => BwdDataAlgo::from_index(index).map(Self::BackwardData),
            Direction::BackwardFilter => {
                BwdFilterAlgo::from_index(index).map(Self::BackwardFilter)
            }
        }
    }

    /// Every identifier of `direction`, ascending.
    pub fn all(direction: Direction) -> Vec<Self> {
        (0..direction.algorithm_count())
            .filter_map(|index| Self::from_index(direction, index))
            .collect()
    }
}

impl fmt::Display for ConvolutionAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<FwdAlgo> for ConvolutionAlgo {
    fn from(algo: FwdAlgo) -> Self {
        Self::Forward(algo)
    }
}

impl From<BwdDataAlgo> for ConvolutionAlgo {
    fn from(algo: BwdDataAlgo) -> Self {
        Self::BackwardData(algo)
    }
}

impl From<BwdFilterAlgo> for ConvolutionAlgo {
    fn from(algo: BwdFilterAlgo) -> Self {
        Self::BackwardFilter(algo)
    }
}

impl Direction {
    /// Size of this direction's identifier space.
    pub fn algorithm_count(self) -> usize {
        match self {
            Self::Forward => FwdAlgo::COUNT,
            Self::BackwardData => BwdDataAlgo::COUNT,
            Self::BackwardFilter => BwdFilterAlgo::COUNT,
        }
    }
}
