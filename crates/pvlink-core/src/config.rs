//! 客户端引擎的只读配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：服务器地址、超时与资源上限由外部配置加载方提供，引擎只消费；
//!   统一收敛到 [`ClientConfig`]，避免参数在各组件间散落。
//! - **契约 (What)**：所有字段都有默认值（`#[serde(default)]`），TOML 中时长写作
//!   秒数浮点（`connection_timeout = 2.5`）；[`ClientConfig::validate`] 拒绝会让状态机
//!   失去意义的组合。
//! - **注意事项**：不读取环境变量，该职责属于外部配置加载方。

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CaError, Result};

/// 服务器默认监听的搜索端口。
pub const DEFAULT_SERVER_PORT: u16 = 5064;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// 单播搜索目标；端口缺省时使用 `broadcast_port`。
    pub server_addresses: Vec<SocketAddr>,
    /// 是否同时向本地广播地址发送搜索。
    pub auto_discovery: bool,
    pub broadcast_port: u16,
    /// `Connecting` 状态允许停留的最长时间。
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub search_initial_period: Duration,
    #[serde(with = "duration_secs")]
    pub search_retry_ceiling: Duration,
    /// Kill Timer 的静默上限。
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,
    /// 空闲多久后发送回声探测。
    #[serde(with = "duration_secs")]
    pub echo_period: Duration,
    pub max_array_bytes: usize,
    pub max_circuits: usize,
    pub max_channels: usize,
    pub client_name: String,
    pub host_name: String,
    /// 通道连接后是否自动读取单位、精度与上下限。
    pub fetch_metadata: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addresses: Vec::new(),
            auto_discovery: true,
            broadcast_port: DEFAULT_SERVER_PORT,
            connection_timeout: Duration::from_secs(5),
            search_initial_period: Duration::from_millis(500),
            search_retry_ceiling: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(30),
            echo_period: Duration::from_secs(15),
            max_array_bytes: 16 * 1024,
            max_circuits: 1024,
            max_channels: 65_536,
            client_name: "pvlink".to_owned(),
            host_name: "localhost".to_owned(),
            fetch_metadata: false,
        }
    }
}

impl ClientConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(raw).map_err(|err| CaError::invalid_config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("connection_timeout", self.connection_timeout),
            ("search_initial_period", self.search_initial_period),
            ("search_retry_ceiling", self.search_retry_ceiling),
            ("inactivity_timeout", self.inactivity_timeout),
            ("echo_period", self.echo_period),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(CaError::invalid_config(format!("{name} must be positive")));
        }
        if self.search_retry_ceiling < self.search_initial_period {
            return Err(CaError::invalid_config(
                "search_retry_ceiling must not be shorter than search_initial_period",
            ));
        }
        if self.echo_period >= self.inactivity_timeout {
            return Err(CaError::invalid_config(
                "echo_period must be shorter than inactivity_timeout",
            ));
        }
        if self.max_circuits == 0 || self.max_channels == 0 {
            return Err(CaError::invalid_config("registry limits must be positive"));
        }
        if !self.auto_discovery && self.server_addresses.is_empty() {
            return Err(CaError::invalid_config(
                "auto_discovery is off and no server_addresses are configured",
            ));
        }
        Ok(())
    }
}

/// 以秒数浮点表示 [`Duration`] 的 serde 适配器。
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|err| D::Error::custom(format!("invalid duration {secs}: {err}")))
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClientConfig::default()
            .validate()
            .expect("默认配置必须通过校验");
    }

    #[test]
    fn toml_durations_are_fractional_seconds() {
        let config = ClientConfig::from_toml_str(
            r#"
            server_addresses = ["10.0.0.5:5064"]
            auto_discovery = false
            connection_timeout = 2.5
            inactivity_timeout = 10
            echo_period = 4
            fetch_metadata = true
            "#,
        )
        .expect("合法配置应解析成功");
        assert_eq!(config.connection_timeout, Duration::from_millis(2500));
        assert_eq!(config.inactivity_timeout, Duration::from_secs(10));
        assert_eq!(config.broadcast_port, DEFAULT_SERVER_PORT);
        assert!(!config.auto_discovery);
        assert!(config.fetch_metadata);
        assert!(!ClientConfig::default().fetch_metadata, "默认不自动读取元数据");
    }

    #[test]
    fn inconsistent_bounds_are_rejected() {
        let config = ClientConfig {
            echo_period: Duration::from_secs(30),
            ..ClientConfig::default()
        };
        let err = config.validate().expect_err("回声周期不短于静默上限必须被拒绝");
        assert_eq!(err.code(), "pvlink.config.invalid");

        let err = ClientConfig::from_toml_str("search_retry_ceiling = 0.1")
            .expect_err("上限短于初始周期必须被拒绝");
        assert!(err.is_misuse());

        let err = ClientConfig::from_toml_str("connection_timeout = -1.0")
            .expect_err("负数时长必须被拒绝");
        assert!(err.is_misuse());
    }
}
