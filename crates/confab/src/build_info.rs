use serde::Serialize;

pub use confab_engine_protocol::PROTOCOL_VERSION as ENGINE_PROTOCOL;

// ============================================================================
// Constants
// ============================================================================

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = match option_env!("BUILD_COMMIT") {
    Some(c) => c,
    None => "unknown",
};

/// Full version string including commit and engine protocol revision.
pub fn version_string() -> String {
    format!(
        "{} (commit: {}, engine protocol: v{})",
        VERSION, COMMIT, ENGINE_PROTOCOL
    )
}

// ============================================================================
// BuildInfo
// ============================================================================

/// Build metadata printed by `confab check` and logged at startup.
#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub engine_protocol: u32,
}

impl BuildInfo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: VERSION,
            commit: COMMIT,
            engine_protocol: ENGINE_PROTOCOL,
        }
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new()
    }
}
