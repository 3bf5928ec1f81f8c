use serde::Deserialize;

use rusty_interceptor_core::MAX_PAYLOAD_LENGTH;

/// Session settings; every field has a default so a config file only needs
/// the values it overrides.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Address the redirected client connects to.
    pub listen: String,
    /// Real server `host:port`, resolved at connect time.
    pub upstream: String,
    /// Client frames relayed in plaintext before key recovery runs.
    pub plaintext_frames: usize,
    pub settle_delay_ms: u64,
    /// Upper bound on the single read used as the recovery window.
    pub recovery_window_bytes: usize,
    /// Payload lengths above this are treated as a stream desync.
    pub max_frame_length: usize,
    pub recover_key: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: default_upstream(),
            plaintext_frames: 3,
            settle_delay_ms: 1000,
            recovery_window_bytes: 3072,
            max_frame_length: MAX_PAYLOAD_LENGTH,
            recover_key: true,
        }
    }
}

impl InterceptorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recovery_window_bytes == 0 {
            anyhow::bail!("recovery_window_bytes must be at least 1");
        }
        if self.max_frame_length == 0 || self.max_frame_length > i32::MAX as usize - 2 {
            anyhow::bail!(
                "max_frame_length must be within 1..={}, got {}",
                i32::MAX as usize - 2,
                self.max_frame_length
            );
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "127.0.0.1:38101".to_string()
}

fn default_upstream() -> String {
    "game-us.habbo.com:38101".to_string()
}
