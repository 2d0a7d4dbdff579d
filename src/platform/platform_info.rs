//! Core count and buffer capacities of one accelerator.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};

/// Path of a JSON `PlatformInfo` to load instead of the default preset.
pub const PLATFORM_FILE_ENV: &str = "CONV_TILING_PLATFORM";
/// Overrides `core_num` of whichever description was loaded.
pub const CORE_NUM_ENV: &str = "CONV_TILING_CORE_NUM";

/// Resource limits of a target device. All sizes in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Human-readable device name (part of the fingerprint)
    pub name: String,
    /// Number of cube cores that can run tiles concurrently
    pub core_num: u64,
    /// Stage buffer between global memory and the compute buffers
    pub l1_size: u64,
    /// Compute buffer for the A (feature map) operand
    pub l0a_size: u64,
    /// Compute buffer for the B (weight) operand
    pub l0b_size: u64,
    /// Accumulator buffer
    pub l0c_size: u64,
    /// Vector-engine scratch buffer
    pub ub_size: u64,
    /// Bias table feeding the accumulator
    pub bt_size: u64,
}

impl Default for PlatformInfo {
    /// 32-core training-class device.
    fn default() -> Self {
        PlatformInfo {
            name: "cube-32c".to_string(),
            core_num: 32,
            l1_size: 512 * 1024,
            l0a_size: 64 * 1024,
            l0b_size: 64 * 1024,
            l0c_size: 256 * 1024,
            ub_size: 248 * 1024,
            bt_size: 1024,
        }
    }
}

impl PlatformInfo {
    /// 8-core edge-class device with a larger stage buffer.
    pub fn inference() -> Self {
        PlatformInfo {
            name: "cube-8c".to_string(),
            core_num: 8,
            l1_size: 1024 * 1024,
            l0a_size: 64 * 1024,
            l0b_size: 64 * 1024,
            l0c_size: 128 * 1024,
            ub_size: 256 * 1024,
            bt_size: 1024,
        }
    }

    /// Default preset with a different core count.
    pub fn with_core_num(core_num: u64) -> Self {
        PlatformInfo {
            name: format!("cube-{core_num}c"),
            core_num,
            ..Default::default()
        }
    }

    /// Load a description from a JSON file.
    pub fn from_json_file(path: &Path) -> TilingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let info: PlatformInfo = serde_json::from_str(&content)?;
        info.validate()?;
        log::info!("Loaded platform '{}' from {:?}", info.name, path);
        Ok(info)
    }

    /// Resolve from `CONV_TILING_PLATFORM` / `CONV_TILING_CORE_NUM`.
    pub fn from_env() -> TilingResult<Self> {
        let mut info = match std::env::var(PLATFORM_FILE_ENV) {
            Ok(path) if !path.is_empty() => Self::from_json_file(Path::new(&path))?,
            _ => Self::default(),
        };
        if let Ok(v) = std::env::var(CORE_NUM_ENV) {
            info.core_num = v.trim().parse().map_err(|_| {
                TilingError::Platform(format!("{CORE_NUM_ENV}={v:?} is not an integer"))
            })?;
        }
        info.validate()?;
        Ok(info)
    }

    /// Reject descriptions with zero cores or zero-sized buffers.
    pub fn validate(&self) -> TilingResult<()> {
        let fields = [
            (self.core_num, "core_num"),
            (self.l1_size, "l1_size"),
            (self.l0a_size, "l0a_size"),
            (self.l0b_size, "l0b_size"),
            (self.l0c_size, "l0c_size"),
            (self.ub_size, "ub_size"),
            (self.bt_size, "bt_size"),
        ];
        for (v, name) in fields {
            if v == 0 {
                return Err(TilingError::Platform(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Stable identity used to key cached tiling results.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}_c{}_l1{}_a{}_b{}_c{}_ub{}_bt{}",
            self.name,
            self.core_num,
            self.l1_size,
            self.l0a_size,
            self.l0b_size,
            self.l0c_size,
            self.ub_size,
            self.bt_size
        )
    }
}

impl fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} cores, L1={}KB L0A={}KB L0B={}KB L0C={}KB UB={}KB",
            self.name,
            self.core_num,
            self.l1_size / 1024,
            self.l0a_size / 1024,
            self.l0b_size / 1024,
            self.l0c_size / 1024,
            self.ub_size / 1024
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        PlatformInfo::default().validate().unwrap();
        PlatformInfo::inference().validate().unwrap();
        assert_eq!(PlatformInfo::with_core_num(64).core_num, 64);
    }

    #[test]
    fn test_zero_core_rejected() {
        let p = PlatformInfo { core_num: 0, ..Default::default() };
        assert!(matches!(p.validate(), Err(TilingError::Platform(_))));
    }

    #[test]
    fn test_json_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("conv_tiling_platform_{}.json", std::process::id()));
        let p = PlatformInfo::inference();
        std::fs::write(&path, serde_json::to_string_pretty(&p).unwrap()).unwrap();
        let loaded = PlatformInfo::from_json_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, p);
    }

    #[test]
    fn test_fingerprint_distinguishes_capacity() {
        let a = PlatformInfo::default();
        let b = PlatformInfo { l1_size: a.l1_size / 2, ..a.clone() };
        assert_ne!(a.fingerprint(), b.fingerprint());
        eprintln!("{a}");
    }
}
