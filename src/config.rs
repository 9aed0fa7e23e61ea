//! Plugin settings: the `serde`-deserializable configuration the embedder
//! hands to `StateManager`/`Scheduler`/`DataPlane` constructors (§4.7, §6).
//! Loading these from YAML/files/env and validating device/handler
//! registration is out of scope (§1) — this crate consumes an
//! already-populated `PluginSettings` value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DataPlaneError, Result};

/// `serial` serializes all device I/O behind one process-wide mutex;
/// `parallel` runs device I/O concurrently subject only to the rate limiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Parallel,
    Serial,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if secs < 0.0 {
            return Err(serde::de::Error::custom("duration must not be negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSettings {
    pub disable: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    pub queue_size: usize,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            disable: false,
            interval: Duration::ZERO,
            delay: Duration::ZERO,
            queue_size: 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteSettings {
    pub disable: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    pub batch_size: usize,
    pub queue_size: usize,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            disable: false,
            interval: Duration::ZERO,
            delay: Duration::ZERO,
            batch_size: 100,
            queue_size: 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub disable: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(60 * 60 * 24),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60 * 24),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Sustained token-bucket rate in tokens/sec. 0 disables the limiter
    /// unless `burst` is also set.
    pub rate: u32,
    /// Token-bucket burst. 0 disables the limiter when `rate` is also 0.
    pub burst: u32,
}

impl LimiterSettings {
    pub fn is_enabled(&self) -> bool {
        self.rate > 0 || self.burst > 0
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub mode: Mode,
    pub read: ReadSettings,
    pub write: WriteSettings,
    pub listen: ListenSettings,
    pub cache: CacheSettings,
    pub transaction: TransactionSettings,
    pub limiter: LimiterSettings,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            read: ReadSettings::default(),
            write: WriteSettings::default(),
            listen: ListenSettings::default(),
            cache: CacheSettings::default(),
            transaction: TransactionSettings::default(),
            limiter: LimiterSettings::default(),
        }
    }
}

impl PluginSettings {
    /// Rejects settings that would make the engine deadlock or silently
    /// never run rather than leaving the implementer to discover a
    /// zero-capacity channel the hard way (§4.7).
    pub fn validate(&self) -> Result<()> {
        if self.read.queue_size == 0 {
            return Err(DataPlaneError::InvalidSettings(
                "read.queueSize must be greater than zero".into(),
            ));
        }
        if self.write.queue_size == 0 {
            return Err(DataPlaneError::InvalidSettings(
                "write.queueSize must be greater than zero".into(),
            ));
        }
        if self.write.batch_size == 0 {
            return Err(DataPlaneError::InvalidSettings(
                "write.batchSize must be greater than zero".into(),
            ));
        }
        if self.cache.enabled && self.cache.ttl.is_zero() {
            return Err(DataPlaneError::InvalidSettings(
                "cache.ttl must be greater than zero when cache.enabled".into(),
            ));
        }
        if self.transaction.ttl.is_zero() {
            return Err(DataPlaneError::InvalidSettings(
                "transaction.ttl must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PluginSettings::default().validate().unwrap();
    }

    #[test]
    fn zero_queue_size_is_rejected() {
        let mut settings = PluginSettings::default();
        settings.read.queue_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let settings = PluginSettings::default();
        let encoded = serde_json::to_string(&settings).unwrap();
        let decoded: PluginSettings = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.mode, settings.mode);
    }
}
