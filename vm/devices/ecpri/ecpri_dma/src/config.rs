// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware-version dependent configuration.
//!
//! Values that differ between hardware revisions live in one table keyed by
//! `(HwVersion, ConfigField)`. The engine resolves the table once, at
//! construction, into a [`HwConfig`] and never consults the version again.

use crate::datapath::MAX_CHAIN_LEN;
use crate::error::ConfigError;
use crate::ring::Moderation;

/// A supported hardware revision.
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HwVersion {
    V1_0,
    V2_0,
    V2_1,
}

impl HwVersion {
    /// The version as printed in logs, e.g. `"2.0"`.
    pub fn name(&self) -> &'static str {
        match self {
            HwVersion::V1_0 => "1.0",
            HwVersion::V2_0 => "2.0",
            HwVersion::V2_1 => "2.1",
        }
    }
}

/// A version-dependent configuration value. Each maps to the [`HwConfig`]
/// field of the same name.
#[allow(missing_docs)] // self-explanatory variants
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConfigField {
    ChannelCount,
    DefaultRingLength,
    MaxChainLength,
    MaxSinglePacketSize,
    MemcpyRingLength,
    WrapperCacheHighWater,
    ExceptionPoolSize,
    ExceptionBufferSize,
    ExceptionBudget,
    ModerationTimerUs,
    ModerationPacketCount,
}

impl ConfigField {
    const ALL: [ConfigField; 11] = [
        ConfigField::ChannelCount,
        ConfigField::DefaultRingLength,
        ConfigField::MaxChainLength,
        ConfigField::MaxSinglePacketSize,
        ConfigField::MemcpyRingLength,
        ConfigField::WrapperCacheHighWater,
        ConfigField::ExceptionPoolSize,
        ConfigField::ExceptionBufferSize,
        ConfigField::ExceptionBudget,
        ConfigField::ModerationTimerUs,
        ConfigField::ModerationPacketCount,
    ];

    /// The field name as used in errors.
    pub fn name(&self) -> &'static str {
        match self {
            ConfigField::ChannelCount => "channel_count",
            ConfigField::DefaultRingLength => "default_ring_len",
            ConfigField::MaxChainLength => "max_chain_len",
            ConfigField::MaxSinglePacketSize => "max_single_packet_size",
            ConfigField::MemcpyRingLength => "memcpy_ring_len",
            ConfigField::WrapperCacheHighWater => "wrapper_cache_high_water",
            ConfigField::ExceptionPoolSize => "exception_pool_size",
            ConfigField::ExceptionBufferSize => "exception_buffer_size",
            ConfigField::ExceptionBudget => "exception_budget",
            ConfigField::ModerationTimerUs => "moderation_timer_us",
            ConfigField::ModerationPacketCount => "moderation_packet_count",
        }
    }
}

fn config_table() -> &'static [(HwVersion, ConfigField, u32)] {
    use ConfigField::*;
    use HwVersion::*;

    &[
        (V1_0, ChannelCount, 24),
        (V1_0, DefaultRingLength, 256),
        (V1_0, MaxChainLength, 4),
        (V1_0, MaxSinglePacketSize, 0xffff),
        (V1_0, MemcpyRingLength, 32),
        (V1_0, WrapperCacheHighWater, 128),
        (V1_0, ExceptionPoolSize, 32),
        (V1_0, ExceptionBufferSize, 2048),
        (V1_0, ExceptionBudget, 32),
        (V1_0, ModerationTimerUs, 0),
        (V1_0, ModerationPacketCount, 0),
        (V2_0, ChannelCount, 32),
        (V2_0, DefaultRingLength, 512),
        (V2_0, MaxChainLength, 8),
        (V2_0, MaxSinglePacketSize, 0x10_0000),
        (V2_0, MemcpyRingLength, 64),
        (V2_0, WrapperCacheHighWater, 256),
        (V2_0, ExceptionPoolSize, 64),
        (V2_0, ExceptionBufferSize, 2048),
        (V2_0, ExceptionBudget, 32),
        (V2_0, ModerationTimerUs, 32),
        (V2_0, ModerationPacketCount, 8),
        (V2_1, ChannelCount, 40),
        (V2_1, DefaultRingLength, 512),
        (V2_1, MaxChainLength, 8),
        (V2_1, MaxSinglePacketSize, 0x10_0000),
        (V2_1, MemcpyRingLength, 64),
        (V2_1, WrapperCacheHighWater, 256),
        (V2_1, ExceptionPoolSize, 64),
        (V2_1, ExceptionBufferSize, 4096),
        (V2_1, ExceptionBudget, 64),
        (V2_1, ModerationTimerUs, 16),
        (V2_1, ModerationPacketCount, 16),
    ]
}

/// Configuration values resolved for one hardware version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwConfig {
    /// The version the values were resolved for.
    pub version: HwVersion,
    /// Number of hardware channels; channel ids are `0..channel_count`.
    pub channel_count: u32,
    /// Ring length of endpoints that do not set their own.
    pub default_ring_len: usize,
    /// Maximum buffers per packet.
    pub max_chain_len: usize,
    /// Largest single memcpy transfer in bytes.
    pub max_single_packet_size: u64,
    /// Ring length of memcpy endpoints.
    pub memcpy_ring_len: usize,
    /// Arena capacity above which an idle wrapper arena is shrunk.
    pub wrapper_cache_high_water: usize,
    /// Receive buffers kept posted on the exception path.
    pub exception_pool_size: usize,
    /// Size of each exception path buffer.
    pub exception_buffer_size: usize,
    /// Packets handled per exception drain pass.
    pub exception_budget: usize,
    /// Moderation of endpoints that do not set their own.
    pub default_moderation: Moderation,
}

/// Lookup over the static configuration table.
pub struct ConfigRegistry;

impl ConfigRegistry {
    /// Returns the raw value of `field` for `version`.
    pub fn lookup(version: HwVersion, field: ConfigField) -> Option<u32> {
        config_table()
            .iter()
            .find(|&&(v, f, _)| v == version && f == field)
            .map(|&(_, _, value)| value)
    }

    /// Resolves every field for `version`.
    pub fn resolve(version: HwVersion) -> Result<HwConfig, ConfigError> {
        for field in ConfigField::ALL {
            if Self::lookup(version, field).is_none() {
                return Err(ConfigError::MissingField {
                    version: version.name(),
                    field: field.name(),
                });
            }
        }
        let get = |field| Self::lookup(version, field).unwrap_or_default();
        Ok(HwConfig {
            version,
            channel_count: get(ConfigField::ChannelCount),
            default_ring_len: get(ConfigField::DefaultRingLength) as usize,
            max_chain_len: get(ConfigField::MaxChainLength) as usize,
            max_single_packet_size: get(ConfigField::MaxSinglePacketSize).into(),
            memcpy_ring_len: get(ConfigField::MemcpyRingLength) as usize,
            wrapper_cache_high_water: get(ConfigField::WrapperCacheHighWater) as usize,
            exception_pool_size: get(ConfigField::ExceptionPoolSize) as usize,
            exception_buffer_size: get(ConfigField::ExceptionBufferSize) as usize,
            exception_budget: get(ConfigField::ExceptionBudget) as usize,
            default_moderation: Moderation {
                timer_us: get(ConfigField::ModerationTimerUs) as u16,
                packet_count: get(ConfigField::ModerationPacketCount) as u8,
            },
        })
    }
}

/// Integrator overrides applied on top of the resolved table values. Each
/// replaces the [`HwConfig`] field of the same name.
#[allow(missing_docs)] // self-explanatory fields
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub default_ring_len: Option<usize>,
    pub max_chain_len: Option<usize>,
    pub max_single_packet_size: Option<u64>,
    pub memcpy_ring_len: Option<usize>,
    pub wrapper_cache_high_water: Option<usize>,
    pub exception_pool_size: Option<usize>,
    pub exception_buffer_size: Option<usize>,
    pub exception_budget: Option<usize>,
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The hardware revision to configure for.
    pub hw_version: HwVersion,
    /// Values replacing the table defaults.
    pub overrides: ConfigOverrides,
}

impl EngineConfig {
    /// Returns a configuration for `hw_version` with no overrides.
    pub fn new(hw_version: HwVersion) -> Self {
        Self {
            hw_version,
            overrides: ConfigOverrides::default(),
        }
    }

    /// Resolves the table for the configured version and applies overrides.
    pub fn resolve(&self) -> Result<HwConfig, ConfigError> {
        let mut config = ConfigRegistry::resolve(self.hw_version)?;
        let ConfigOverrides {
            default_ring_len,
            max_chain_len,
            max_single_packet_size,
            memcpy_ring_len,
            wrapper_cache_high_water,
            exception_pool_size,
            exception_buffer_size,
            exception_budget,
        } = self.overrides;

        fn nonzero<T: Copy + Into<u64>>(name: &'static str, value: T) -> Result<T, ConfigError> {
            if value.into() == 0 {
                Err(ConfigError::InvalidParameter { name, value: 0 })
            } else {
                Ok(value)
            }
        }

        if let Some(v) = default_ring_len {
            config.default_ring_len = nonzero("default_ring_len", v as u64)? as usize;
        }
        if let Some(v) = max_chain_len {
            if v > MAX_CHAIN_LEN {
                return Err(ConfigError::InvalidParameter {
                    name: "max_chain_len",
                    value: v as u64,
                });
            }
            config.max_chain_len = nonzero("max_chain_len", v as u64)? as usize;
        }
        if let Some(v) = max_single_packet_size {
            config.max_single_packet_size = nonzero("max_single_packet_size", v)?;
        }
        if let Some(v) = memcpy_ring_len {
            config.memcpy_ring_len = nonzero("memcpy_ring_len", v as u64)? as usize;
        }
        if let Some(v) = wrapper_cache_high_water {
            config.wrapper_cache_high_water = v;
        }
        if let Some(v) = exception_pool_size {
            config.exception_pool_size = nonzero("exception_pool_size", v as u64)? as usize;
        }
        if let Some(v) = exception_buffer_size {
            config.exception_buffer_size = nonzero("exception_buffer_size", v as u64)? as usize;
        }
        if let Some(v) = exception_budget {
            config.exception_budget = nonzero("exception_budget", v as u64)? as usize;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_version_resolves() {
        for version in [HwVersion::V1_0, HwVersion::V2_0, HwVersion::V2_1] {
            let config = ConfigRegistry::resolve(version).unwrap();
            assert_eq!(config.version, version);
            assert!(config.channel_count > 0);
            assert!(config.max_chain_len > 0);
        }
    }

    #[test]
    fn versions_differ() {
        let v1 = ConfigRegistry::resolve(HwVersion::V1_0).unwrap();
        let v2 = ConfigRegistry::resolve(HwVersion::V2_0).unwrap();
        assert_eq!(v1.max_chain_len, 4);
        assert_eq!(v2.max_chain_len, 8);
        assert_eq!(v2.default_moderation.packet_count, 8);
    }

    #[test]
    fn overrides_apply() {
        let mut config = EngineConfig::new(HwVersion::V1_0);
        config.overrides.default_ring_len = Some(8);
        config.overrides.exception_budget = Some(5);
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.default_ring_len, 8);
        assert_eq!(resolved.exception_budget, 5);
        assert_eq!(resolved.max_chain_len, 4);
    }

    #[test]
    fn chain_limit_bounds_override() {
        let mut config = EngineConfig::new(HwVersion::V2_0);
        config.overrides.max_chain_len = Some(MAX_CHAIN_LEN + 1);
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::InvalidParameter {
                name: "max_chain_len",
                value: 257,
            })
        ));
        config.overrides.max_chain_len = Some(MAX_CHAIN_LEN);
        assert_eq!(config.resolve().unwrap().max_chain_len, MAX_CHAIN_LEN);
    }

    #[test]
    fn zero_override_rejected() {
        let mut config = EngineConfig::new(HwVersion::V2_1);
        config.overrides.max_chain_len = Some(0);
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::InvalidParameter {
                name: "max_chain_len",
                ..
            })
        ));
    }
}
