//! Relay addresses, overridable from the environment.

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// The broker's two broadcast addresses.
///
/// The broker binds both; a connection dials both with the directions
/// swapped relative to the broker's binds, sending to the ingress and
/// receiving from the egress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Producer-facing address. Env: `RELAY_INGRESS_ADDR`.
    #[serde(default = "default_ingress")]
    pub ingress_addr: String,
    /// Consumer-facing address. Env: `RELAY_EGRESS_ADDR`.
    #[serde(default = "default_egress")]
    pub egress_addr: String,
}

fn default_ingress() -> String {
    "127.0.0.1:7411".to_string()
}

fn default_egress() -> String {
    "127.0.0.1:7412".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ingress_addr: default_ingress(),
            egress_addr: default_egress(),
        }
    }
}

impl RelayConfig {
    /// Defaults merged with `RELAY_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, RelayError> {
        Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Env::prefixed("RELAY_"))
            .extract()
            .map_err(|e| RelayError::Config(e.to_string()))
    }
}
