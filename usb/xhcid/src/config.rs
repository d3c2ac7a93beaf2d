//! Driver configuration.
//!
//! The defaults live in `config.toml` next to the crate manifest and are compiled in. A user file
//! only needs the keys it changes.

use std::str::FromStr;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{warn, LevelFilter};
use serde::Deserialize;

lazy_static! {
    pub static ref DEFAULT_CONFIG: XhciConfig = {
        const TOML: &[u8] = include_bytes!("../config.toml");

        toml::from_slice::<XhciConfig>(TOML).expect("Failed to parse internally embedded config file")
    };
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct XhciConfig {
    /// Refuse every controller during discovery.
    pub nousbxhci: bool,
    /// Do not ask the BIOS to give up the controller. SMIs are disabled regardless.
    pub noxhcihandoff: bool,
    pub maxxhci: usize,
    pub command_timeout_ms: u64,
    /// How long to wait for the completion of an abort or Stop Endpoint before giving up.
    pub abort_grace_ms: u64,
    pub recovery_poll_ms: u64,
    pub quiesce_interval_ms: u64,
    pub port_reset_ms: u64,
    pub irq_poll_interval_ms: u64,
    pub log_level: String,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overrides {
    nousbxhci: Option<bool>,
    noxhcihandoff: Option<bool>,
    maxxhci: Option<usize>,
    command_timeout_ms: Option<u64>,
    abort_grace_ms: Option<u64>,
    recovery_poll_ms: Option<u64>,
    quiesce_interval_ms: Option<u64>,
    port_reset_ms: Option<u64>,
    irq_poll_interval_ms: Option<u64>,
    log_level: Option<String>,
}

impl Default for XhciConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

impl XhciConfig {
    /// Parses a user configuration, taking every missing key from the embedded defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        let o: Overrides = toml::from_str(text)?;
        let d = Self::default();

        Ok(Self {
            nousbxhci: o.nousbxhci.unwrap_or(d.nousbxhci),
            noxhcihandoff: o.noxhcihandoff.unwrap_or(d.noxhcihandoff),
            maxxhci: o.maxxhci.unwrap_or(d.maxxhci),
            command_timeout_ms: o.command_timeout_ms.unwrap_or(d.command_timeout_ms),
            abort_grace_ms: o.abort_grace_ms.unwrap_or(d.abort_grace_ms),
            recovery_poll_ms: o.recovery_poll_ms.unwrap_or(d.recovery_poll_ms),
            quiesce_interval_ms: o.quiesce_interval_ms.unwrap_or(d.quiesce_interval_ms),
            port_reset_ms: o.port_reset_ms.unwrap_or(d.port_reset_ms),
            irq_poll_interval_ms: o.irq_poll_interval_ms.unwrap_or(d.irq_poll_interval_ms),
            log_level: o.log_level.unwrap_or(d.log_level),
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn recovery_poll(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_ms)
    }

    pub fn quiesce_interval(&self) -> Duration {
        Duration::from_millis(self.quiesce_interval_ms)
    }

    pub fn port_reset(&self) -> Duration {
        Duration::from_millis(self.port_reset_ms)
    }

    pub fn irq_poll_interval(&self) -> Duration {
        Duration::from_millis(self.irq_poll_interval_ms)
    }

    pub fn log_level(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or_else(|_| {
            warn!("unknown log level {:?}, using info", self.log_level);
            LevelFilter::Info
        })
    }
}
