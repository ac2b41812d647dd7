//! Resource limits configuration.
//!
//! This module contains the [`ResourceLimits`] struct describing the quotas
//! applied to every workspace container, and the [`ByteSize`] helper used to
//! write memory sizes as "1g" / "512m" in YAML.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Per-container resource quotas.
///
/// A snapshot of these values is stored with the workspace at launch time,
/// so changing the host configuration only affects containers launched
/// afterwards.
///
/// - `memory` maps to `--memory`
/// - `memory_swap` maps to `--memory-swap` (memory + swap total)
/// - `kernel_memory` maps to `--kernel-memory` (ignored by cgroup v2 engines)
/// - `disk_quota` maps to `--storage-opt size=`, which requires a storage
///   driver with quota support, so it is unset by default
/// - `cpu_period` / `cpu_quota` map to `--cpu-period` / `--cpu-quota`
/// - `pids_limit` maps to `--pids-limit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub memory: ByteSize,

    pub memory_swap: ByteSize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_memory: Option<ByteSize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_quota: Option<ByteSize>,

    /// CFS period in microseconds.
    pub cpu_period: u64,

    /// CFS quota in microseconds per period.
    pub cpu_quota: u64,

    pub pids_limit: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: ByteSize(1 << 30),
            memory_swap: ByteSize(1 << 30),
            kernel_memory: Some(ByteSize(1 << 29)),
            disk_quota: None,
            cpu_period: 100_000,
            cpu_quota: 90_000,
            pids_limit: 1024,
        }
    }
}

impl ResourceLimits {
    /// Engine flags for these limits, in a stable order.
    pub fn to_docker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--memory".to_string(),
            self.memory.as_u64().to_string(),
            "--memory-swap".to_string(),
            self.memory_swap.as_u64().to_string(),
        ];
        if let Some(kernel) = self.kernel_memory {
            args.push("--kernel-memory".to_string());
            args.push(kernel.as_u64().to_string());
        }
        if let Some(disk) = self.disk_quota {
            args.push("--storage-opt".to_string());
            args.push(format!("size={}", disk.as_u64()));
        }
        args.push("--cpu-period".to_string());
        args.push(self.cpu_period.to_string());
        args.push("--cpu-quota".to_string());
        args.push(self.cpu_quota.to_string());
        args.push("--pids-limit".to_string());
        args.push(self.pids_limit.to_string());
        args
    }

    /// Check the limits for values the engine would reject.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.memory.as_u64() < 6 * 1024 * 1024 {
            return Err(format!(
                "limits.memory must be at least 6m (got {})",
                self.memory
            ));
        }
        if self.memory_swap < self.memory {
            return Err(format!(
                "limits.memory_swap ({}) must be >= limits.memory ({})",
                self.memory_swap, self.memory
            ));
        }
        if !(1_000..=1_000_000).contains(&self.cpu_period) {
            return Err(format!(
                "limits.cpu_period must be between 1000 and 1000000 microseconds (got {})",
                self.cpu_period
            ));
        }
        if self.cpu_quota < 1_000 {
            return Err(format!(
                "limits.cpu_quota must be at least 1000 microseconds (got {})",
                self.cpu_quota
            ));
        }
        if self.pids_limit == 0 {
            return Err("limits.pids_limit must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// A byte count that deserializes from either an integer or a size string
/// such as "512m" or "1g" (binary units).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [(1 << 40, "t"), (1 << 30, "g"), (1 << 20, "m"), (1 << 10, "k")];
        for (size, suffix) in UNITS {
            if self.0 != 0 && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Bytes(n) => Ok(ByteSize(n)),
            Raw::Text(text) => parse_memory_to_bytes(&text).map(ByteSize).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "invalid size '{}' (expected e.g. \"512m\", \"1g\")",
                    text
                ))
            }),
        }
    }
}

/// Parse memory string (e.g., "512m", "2g") to bytes
///
/// Returns `None` for:
/// - Invalid format or unrecognized suffix
/// - Negative values
/// - Values that would overflow u64
pub fn parse_memory_to_bytes(memory: &str) -> Option<u64> {
    let memory = memory.trim();
    // Find where suffix starts using char_indices for UTF-8 safety
    let suffix_start = memory
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(byte_idx, _)| byte_idx)
        .unwrap_or(memory.len());

    let value: f64 = memory[..suffix_start].parse().ok()?;
    if value < 0.0 {
        return None;
    }

    let multiplier = match memory[suffix_start..].to_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    let bytes = value * multiplier;
    // Check for overflow before casting (u64::MAX is ~18.4 exabytes)
    if bytes > u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_sizes() {
        assert_eq!(parse_memory_to_bytes("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_to_bytes("1g"), Some(1 << 30));
        assert_eq!(parse_memory_to_bytes("1.5G"), Some(3 << 29));
        assert_eq!(parse_memory_to_bytes("4096"), Some(4096));
        assert_eq!(parse_memory_to_bytes("10x"), None);
        assert_eq!(parse_memory_to_bytes(""), None);
    }

    #[test]
    fn test_byte_size_accepts_strings_and_numbers() {
        let from_str: ByteSize = serde_yaml::from_str("\"2g\"").unwrap();
        let from_num: ByteSize = serde_yaml::from_str("2147483648").unwrap();
        assert_eq!(from_str, from_num);
        assert_eq!(from_str.to_string(), "2g");
    }

    #[test]
    fn test_default_limits_match_host_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory.as_u64(), 1 << 30);
        assert_eq!(limits.cpu_quota, 90_000);
        assert!(limits.disk_quota.is_none());
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_docker_args_include_every_quota() {
        let limits = ResourceLimits {
            disk_quota: Some(ByteSize(1 << 30)),
            ..ResourceLimits::default()
        };
        let args = limits.to_docker_args();
        let joined = args.join(" ");
        assert!(joined.contains("--memory 1073741824"));
        assert!(joined.contains("--memory-swap 1073741824"));
        assert!(joined.contains("--kernel-memory 536870912"));
        assert!(joined.contains("--storage-opt size=1073741824"));
        assert!(joined.contains("--cpu-period 100000"));
        assert!(joined.contains("--cpu-quota 90000"));
        assert!(joined.contains("--pids-limit 1024"));
    }

    #[test]
    fn test_validate_rejects_swap_below_memory() {
        let limits = ResourceLimits {
            memory_swap: ByteSize(1 << 20),
            ..ResourceLimits::default()
        };
        assert!(limits.validate().unwrap_err().contains("memory_swap"));
    }

    #[test]
    fn test_validate_rejects_zero_pids() {
        let limits = ResourceLimits {
            pids_limit: 0,
            ..ResourceLimits::default()
        };
        assert!(limits.validate().is_err());
    }
}
