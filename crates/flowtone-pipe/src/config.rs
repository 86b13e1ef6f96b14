use serde::{Deserialize, Serialize};

use flowtone_core::BufferSize;

/// Construction-time pipe options. Immutable once the pipe is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Human label used in diagnostics and runner thread names.
    pub name: String,
    /// Target frame count per block produced by the pump.
    pub buffer_size: BufferSize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            name: "pipe".to_string(),
            buffer_size: BufferSize(512),
        }
    }
}
