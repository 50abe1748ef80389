//! Configuration records consumed by the descriptor builder, and process
//! tunables.
//!
//! Records deserialize from JSON with the engine's enum names, e.g.
//!
//! ```json
//! {
//!   "input": { "data_type": "FLOAT", "dimensions": [1, 1, 4, 4], "format": "NCHW" },
//!   "filter": { "data_type": "FLOAT", "format": "NCHW", "dimensions": [1, 1, 3, 3] },
//!   "convolution": { "pad": [0, 0], "compute_type": "FLOAT" },
//!   "direction": "FORWARD"
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::types::{ConvolutionMode, DataType, Direction, MathType, TensorFormat};

/// Tensor description. Exactly one of `strides` and `format` must be given.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TensorConfig {
    pub data_type: Option<DataType>,
    pub dimensions: Vec<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strides: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<TensorFormat>,
}

impl TensorConfig {
    /// A packed tensor in `format`.
    pub fn packed(data_type: DataType, dimensions: &[i32], format: TensorFormat) -> Self {
        Self {
            data_type: Some(data_type),
            dimensions: dimensions.to_vec(),
            strides: Vec::new(),
            format: Some(format),
        }
    }

    /// A tensor with explicit per-axis strides.
    pub fn strided(data_type: DataType, dimensions: &[i32], strides: &[i32]) -> Self {
        Self {
            data_type: Some(data_type),
            dimensions: dimensions.to_vec(),
            strides: strides.to_vec(),
            format: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub data_type: Option<DataType>,
    pub format: Option<TensorFormat>,
    pub dimensions: Vec<i32>,
}

impl FilterConfig {
    pub fn new(data_type: DataType, format: TensorFormat, dimensions: &[i32]) -> Self {
        Self {
            data_type: Some(data_type),
            format: Some(format),
            dimensions: dimensions.to_vec(),
        }
    }
}

/// Convolution parameters. Missing trailing `pad`, `stride` and `dilation`
/// entries default to 0, 1 and 1.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConvolutionParams {
    #[serde(default)]
    pub pad: Vec<i32>,
    #[serde(default)]
    pub stride: Vec<i32>,
    #[serde(default)]
    pub dilation: Vec<i32>,
    #[serde(default)]
    pub mode: ConvolutionMode,
    pub compute_type: Option<DataType>,
    /// `None` or a non-positive count leaves the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_count: Option<i32>,
    #[serde(default)]
    pub math_type: MathType,
}

impl ConvolutionParams {
    pub fn new(pad: &[i32], stride: &[i32], dilation: &[i32], compute_type: DataType) -> Self {
        Self {
            pad: pad.to_vec(),
            stride: stride.to_vec(),
            dilation: dilation.to_vec(),
            compute_type: Some(compute_type),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ConvolutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_group_count(mut self, group_count: i32) -> Self {
        self.group_count = Some(group_count);
        self
    }

    pub fn with_math_type(mut self, math_type: MathType) -> Self {
        self.math_type = math_type;
        self
    }
}

/// One convolution under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub input: TensorConfig,
    pub filter: FilterConfig,
    pub convolution: ConvolutionParams,
    #[serde(default)]
    pub direction: Direction,
    /// Explicit output layout; derived from the other descriptors when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TensorConfig>,
    /// Workspace cap in bytes; the whole available budget when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_limit: Option<usize>,
}

impl ConvolutionConfig {
    pub fn new(
        input: TensorConfig,
        filter: FilterConfig,
        convolution: ConvolutionParams,
        direction: Direction,
    ) -> Self {
        Self {
            label: None,
            input,
            filter,
            convolution,
            direction,
            output: None,
            workspace_limit: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_output(mut self, output: TensorConfig) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_workspace_limit(mut self, bytes: usize) -> Self {
        self.workspace_limit = Some(bytes);
        self
    }

    pub fn from_json(json: &str) -> HarnessResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> HarnessResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Load a JSON array of convolution configs from `path`.
pub fn load_configs(path: impl AsRef<Path>) -> HarnessResult<Vec<ConvolutionConfig>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let configs: Vec<ConvolutionConfig> = serde_json::from_str(&content)?;
    log::info!("Loaded {} convolution configs from {:?}", configs.len(), path);
    Ok(configs)
}

// ── Tunables ─────────────────────────────────────────────────────────

pub const DEVICE_ENV: &str = "CONVCHECK_DEVICE";
pub const DEVICE_MEMORY_LIMIT_ENV: &str = "CONVCHECK_DEVICE_MEMORY_LIMIT_MB";

/// Process-wide settings, validated once when the device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Device ordinal to run on.
    pub device: i32,
    /// Maximum device memory for workspace after tensors have been allocated,
    /// in megabytes. Negative values are an offset from the memory available
    /// at startup.
    pub device_memory_limit_mb: i64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self { device: 0, device_memory_limit_mb: 4096 }
    }
}

impl Tunables {
    /// Defaults overridden by `CONVCHECK_DEVICE` and
    /// `CONVCHECK_DEVICE_MEMORY_LIMIT_MB` when set.
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HarnessResult<Self> {
        let mut tunables = Self::default();
        if let Some(value) = lookup(DEVICE_ENV) {
            tunables.device = value
                .trim()
                .parse()
                .map_err(|_| HarnessError::Env { name: DEVICE_ENV, value })?;
        }
        if let Some(value) = lookup(DEVICE_MEMORY_LIMIT_ENV) {
            tunables.device_memory_limit_mb = value
                .trim()
                .parse()
                .map_err(|_| HarnessError::Env { name: DEVICE_MEMORY_LIMIT_ENV, value })?;
        }
        Ok(tunables)
    }
}
