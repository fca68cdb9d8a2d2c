// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Architectural ceiling on per-connection transient objects; the device
/// cannot hold more saved-object state than this per client anyway.
pub const TRANSIENT_QUOTA_CEILING: u32 = 27;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// How to reach the device underneath the access broker.
    pub device: DeviceConfig,
    /// Resource-manager limits that never touch the wire.
    pub runtime: RuntimeConfig,
}

/// Parameters of the device connection owned by the daemon wiring.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DeviceConfig {
    #[serde(rename = "Address")]
    /// TCTI-style device address (e.g. a character device path or a
    /// simulator endpoint).
    pub address: String,

    #[serde(rename = "TimeoutCommand", with = "serde_secs")]
    /// Upper bound on a single device round-trip.
    pub timeout_command: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Per-connection quotas enforced by the worker.
pub struct RuntimeConfig {
    #[serde(rename = "MaxTransientObjects")]
    /// Transient objects one connection may hold concurrently.
    pub max_transient_objects: u32,

    #[serde(rename = "MaxSessions")]
    /// Sessions one connection may hold concurrently.
    pub max_sessions: u32,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.device.address.is_empty(),
            "device Address must not be empty"
        );

        ensure!(
            self.runtime.max_transient_objects >= 1,
            "MaxTransientObjects must be >= 1"
        );
        // Clamp rather than reject: the ceiling is architectural, not a
        // user error.
        if self.runtime.max_transient_objects > TRANSIENT_QUOTA_CEILING {
            self.runtime.max_transient_objects = TRANSIENT_QUOTA_CEILING;
        }

        ensure!(self.runtime.max_sessions >= 1, "MaxSessions must be >= 1");

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
