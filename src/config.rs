//! Core configuration.

use serde::{Deserialize, Serialize};

use crate::sph::ADDR_SIZE;

/// Static parameters the node hands the dispatch core at init.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrwConfig {
    /// Serialized network address of this node; copied into the `addr` field
    /// of every outbound reply header.
    pub local_addr: [u8; ADDR_SIZE],

    /// Verbosity for [`telemetry::init`](crate::telemetry::init):
    /// 0 errors only, 1 info, 2 and above debug.
    #[serde(default)]
    pub verbosity: u8,
}

impl Default for SrwConfig {
    fn default() -> Self {
        Self {
            local_addr: [0; ADDR_SIZE],
            verbosity: 1,
        }
    }
}
