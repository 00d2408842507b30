// Tunables, serde-friendly like `apps/stream-manager`'s own config so the
// CLI can load overrides from a TOML/JSON file rather than recompiling.

use serde::{Deserialize, Serialize};

/// Local UDP port range for RTP/RTCP, §4.D.1: "random even port in
/// [7000, 7998], 1000 attempts before failing".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    pub port_range_low: u16,
    pub port_range_high: u16,
    pub port_alloc_attempts: u32,
    pub redirect_limit: u32,
    pub reconnect_attempts: u32,
    pub rtcp_interval_secs: u64,
    pub keepalive_interval_secs: u64,
    pub control_read_timeout_secs: u64,
    pub receive_select_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            port_range_low: 7000,
            port_range_high: 7998,
            port_alloc_attempts: 1000,
            redirect_limit: 10,
            reconnect_attempts: 3,
            rtcp_interval_secs: 15,
            keepalive_interval_secs: 15,
            control_read_timeout_secs: 60,
            receive_select_timeout_secs: 1,
            user_agent: "rtsp-client".to_string(),
        }
    }
}

impl RtspConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = RtspConfig::default();
        assert_eq!(cfg.port_range_low, 7000);
        assert_eq!(cfg.port_range_high, 7998);
        assert_eq!(cfg.reconnect_attempts, 3);
        assert_eq!(cfg.redirect_limit, 10);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = RtspConfig::from_toml_str("reconnect_attempts = 5\n").unwrap();
        assert_eq!(cfg.reconnect_attempts, 5);
        assert_eq!(cfg.port_range_low, 7000);
    }
}
