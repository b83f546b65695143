use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_ELEMENT_LEN;
use crate::{GkdError, Result};

const MIN_ELEMENT_LEN: usize = 96; // G2 压缩编码长度

// JSON 中缺省的字段取默认值
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub join_bind: String,      // TA 注册监听
    pub join_addr: String,      // 车辆注册目标
    pub broadcast_addr: String, // 撤销广播目标
    pub update_bind: String,    // 车辆广播监听
    pub ack_bind: String,
    pub ack_addr: String,
    pub io_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_element_len: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            join_bind: "0.0.0.0:9876".into(),
            join_addr: "127.0.0.1:9876".into(),
            broadcast_addr: "255.255.255.255:9999".into(),
            update_bind: "0.0.0.0:9999".into(),
            ack_bind: "0.0.0.0:9998".into(),
            ack_addr: "127.0.0.1:9998".into(),
            io_timeout_ms: 5_000,
            poll_interval_ms: 50,
            max_element_len: DEFAULT_MAX_ELEMENT_LEN,
        }
    }
}

impl NetworkConfig {
    // 全部使用 127.0.0.1 临时端口，绑定后由调用方填写 *_addr
    pub fn loopback() -> Self {
        Self {
            join_bind: "127.0.0.1:0".into(),
            join_addr: "127.0.0.1:0".into(),
            broadcast_addr: "127.0.0.1:0".into(),
            update_bind: "127.0.0.1:0".into(),
            ack_bind: "127.0.0.1:0".into(),
            ack_addr: "127.0.0.1:0".into(),
            io_timeout_ms: 2_000,
            poll_interval_ms: 10,
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| GkdError::Config(format!("config parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| GkdError::Config(format!("config read failed for {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.io_timeout_ms == 0 {
            return Err(GkdError::Config("io_timeout_ms must be positive".into()));
        }
        if self.max_element_len < MIN_ELEMENT_LEN {
            return Err(GkdError::Config(format!(
                "max_element_len must be at least {MIN_ELEMENT_LEN}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_ports() {
        let config = NetworkConfig::default();
        assert!(config.join_bind.ends_with(":9876"));
        assert!(config.broadcast_addr.ends_with(":9999"));
        assert!(config.ack_addr.ends_with(":9998"));
        assert_eq!(config.io_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = NetworkConfig::from_json_str(
            r#"{ "broadcast_addr": "192.168.1.255:9999", "io_timeout_ms": 250 }"#,
        )
        .unwrap();
        assert_eq!(config.broadcast_addr, "192.168.1.255:9999");
        assert_eq!(config.io_timeout_ms, 250);
        assert_eq!(config.join_addr, NetworkConfig::default().join_addr);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            NetworkConfig::from_json_str(r#"{ "io_timeout_ms": 0 }"#),
            Err(GkdError::Config(_))
        ));
        assert!(matches!(
            NetworkConfig::from_json_str(r#"{ "max_element_len": 8 }"#),
            Err(GkdError::Config(_))
        ));
        assert!(matches!(
            NetworkConfig::from_json_str("not json"),
            Err(GkdError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = NetworkConfig::from_json_file("/nonexistent/sgkd.json").unwrap_err();
        assert!(matches!(err, GkdError::Config(_)));
    }

    #[test]
    fn poll_interval_is_never_zero() {
        let config = NetworkConfig {
            poll_interval_ms: 0,
            ..NetworkConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
