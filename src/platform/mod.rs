//! Target device description for the tiling optimizer.
//!
//! Provides `PlatformInfo` (core count and on-chip buffer capacities) and a
//! process-global instance resolved once from the environment.

pub mod platform_info;

pub use platform_info::{PlatformInfo, CORE_NUM_ENV, PLATFORM_FILE_ENV};

use std::sync::OnceLock;

static PLATFORM: OnceLock<PlatformInfo> = OnceLock::new();

/// Get the global platform description (resolved once, cached for process lifetime).
///
/// Falls back to `PlatformInfo::default()` when the environment names no
/// usable description.
pub fn platform_info() -> &'static PlatformInfo {
    PLATFORM.get_or_init(|| match PlatformInfo::from_env() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Ignoring platform override: {}", e);
            PlatformInfo::default()
        }
    })
}
