//! 流客户端配置。
//!
//! 时长在 TOML 中写作秒数浮点，与 `pvlink_core::ClientConfig` 一致。

use std::net::SocketAddr;
use std::time::Duration;

use pvlink_core::config::duration_secs;
use serde::Deserialize;

use crate::error::{Result, StreamError};

/// 日志服务器的常用端口。
pub const DEFAULT_LOG_PORT: u16 = 7004;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub target: SocketAddr,
    /// 重连循环的唤醒周期，同时作为单次建连的截止时间。
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    /// 初次连接允许的尝试次数；`None` 表示不设上限。首次连上之后始终无限重试。
    pub initial_attempts: Option<u32>,
    /// 发送缓冲上限（字节）。
    pub buffer_capacity: usize,
    /// 关闭套接字时等待未发送数据的时长（`SO_LINGER`）。
    #[serde(with = "duration_secs")]
    pub linger: Duration,
    pub keepalive: bool,
    /// 每条消息前附加的前缀。
    pub prefix: Option<String>,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([127, 0, 0, 1], DEFAULT_LOG_PORT)),
            retry_interval: Duration::from_secs(5),
            initial_attempts: None,
            buffer_capacity: 16 * 1024,
            linger: Duration::from_secs(300),
            keepalive: true,
            prefix: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamConfig {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: StreamConfig =
            toml::from_str(raw).map_err(|err| StreamError::invalid_config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_interval.is_zero() {
            return Err(StreamError::invalid_config("retry_interval must be non-zero"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(StreamError::invalid_config("shutdown_timeout must be non-zero"));
        }
        if self.buffer_capacity == 0 {
            return Err(StreamError::invalid_config("buffer_capacity must be non-zero"));
        }
        if self.initial_attempts == Some(0) {
            return Err(StreamError::invalid_config(
                "initial_attempts must allow at least one attempt",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_log_client_conventions() {
        let config = StreamConfig::default();
        config.validate().expect("默认配置合法");
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.linger, Duration::from_secs(300));
        assert_eq!(config.buffer_capacity, 16 * 1024);
        assert_eq!(config.initial_attempts, None);
    }

    #[test]
    fn parses_fractional_seconds() {
        let config = StreamConfig::from_toml_str(
            r#"
            target = "10.1.2.3:7011"
            retry_interval = 0.25
            initial_attempts = 3
            prefix = "ioc1 "
            "#,
        )
        .expect("合法配置");
        assert_eq!(config.target, "10.1.2.3:7011".parse().expect("地址"));
        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.initial_attempts, Some(3));
        assert_eq!(config.prefix.as_deref(), Some("ioc1 "));
    }

    #[test]
    fn rejects_degenerate_values() {
        let zero_attempts = StreamConfig {
            initial_attempts: Some(0),
            ..StreamConfig::default()
        };
        assert!(zero_attempts.validate().is_err());

        let err = StreamConfig::from_toml_str("buffer_capacity = 0").expect_err("容量为零");
        assert_eq!(err.code(), "pvlink.stream.invalid_config");

        assert!(StreamConfig::from_toml_str("unknown = 1").is_err());
    }
}
