//! Coordinator configuration

use serde::{Deserialize, Serialize};

/// Tuning knobs for a coordinator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Buffer size of the command channel between handles and the command
    /// loop. Sends back-pressure callers when full; correctness does not
    /// depend on the value.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_command_buffer() -> usize {
    64
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { command_buffer: 64 }
    }
}
