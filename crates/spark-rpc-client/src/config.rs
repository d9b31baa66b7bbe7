//! # 客户端配置
//!
//! ## 角色定位（Why）
//! - 集中描述建连参数、默认调用超时与选址策略，宿主可从 TOML 片段加载，也可直接构造；
//! - [`ConnectOptions`] 是面向连接器的投影，只包含传输层关心的字段。
//!
//! ## 契约（What）
//! - 缺省字段取 [`ClientOptions::default`] 的值，未知字段视为配置错误；
//! - 超时必须为正值，帧长上限不得小于帧头长度，违反时返回 [`RpcError::Configuration`]。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{RpcError, RpcResult},
    selector::SelectorKind,
};

/// 帧长度前缀（4 字节）加类型字节。
const MIN_FRAME_LEN: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOptions {
    pub connect_timeout_ms: u64,
    pub keep_alive: bool,
    pub reuse_addr: bool,
    pub tcp_no_delay: bool,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    /// 未显式指定超时的调用所使用的默认超时。
    pub read_timeout_ms: u64,
    pub selector: SelectorKind,
    pub max_frame_len: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            keep_alive: true,
            reuse_addr: true,
            tcp_no_delay: true,
            receive_buffer_size: None,
            send_buffer_size: None,
            read_timeout_ms: 30_000,
            selector: SelectorKind::FirstAvailable,
            max_frame_len: 65_536,
        }
    }
}

impl ClientOptions {
    /// 解析并校验 TOML 配置片段。
    pub fn from_toml_str(raw: &str) -> RpcResult<Self> {
        let options: Self = toml::from_str(raw).map_err(|err| RpcError::Configuration {
            detail: err.to_string(),
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> RpcResult<()> {
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms must be greater than zero"));
        }
        if self.read_timeout_ms == 0 {
            return Err(invalid("read_timeout_ms must be greater than zero"));
        }
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(invalid(format!(
                "max_frame_len must be at least {MIN_FRAME_LEN} bytes"
            )));
        }
        if matches!(self.receive_buffer_size, Some(0)) || matches!(self.send_buffer_size, Some(0)) {
            return Err(invalid("socket buffer sizes must be greater than zero"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout(),
            keep_alive: self.keep_alive,
            reuse_addr: self.reuse_addr,
            tcp_no_delay: self.tcp_no_delay,
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            max_frame_len: self.max_frame_len,
        }
    }
}

fn invalid(detail: impl Into<String>) -> RpcError {
    RpcError::Configuration {
        detail: detail.into(),
    }
}

/// 传递给 [`Connector`](crate::transport::Connector) 的建连参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub keep_alive: bool,
    pub reuse_addr: bool,
    pub tcp_no_delay: bool,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub max_frame_len: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ClientOptions::default().connect_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let options = ClientOptions::from_toml_str("").expect("defaults");
        assert_eq!(options, ClientOptions::default());
        assert_eq!(options.connect_timeout(), Duration::from_secs(3));
        assert_eq!(options.read_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn parses_partial_document() {
        let options = ClientOptions::from_toml_str(
            r#"
            connect_timeout_ms = 500
            tcp_no_delay = false
            receive_buffer_size = 131072
            selector = "consistent-hash"
            "#,
        )
        .expect("valid options");
        assert_eq!(options.connect_timeout_ms, 500);
        assert!(!options.tcp_no_delay);
        assert_eq!(options.receive_buffer_size, Some(131_072));
        assert_eq!(options.selector, SelectorKind::ConsistentHash);
        assert!(options.keep_alive);

        let connect = options.connect_options();
        assert_eq!(connect.connect_timeout, Duration::from_millis(500));
        assert_eq!(connect.max_frame_len, 65_536);
    }

    #[test]
    fn rejects_zero_timeouts_and_unknown_fields() {
        assert!(matches!(
            ClientOptions::from_toml_str("read_timeout_ms = 0"),
            Err(RpcError::Configuration { .. })
        ));
        assert!(matches!(
            ClientOptions::from_toml_str("connect_timeout_ms = 0"),
            Err(RpcError::Configuration { .. })
        ));
        assert!(matches!(
            ClientOptions::from_toml_str("retries = 3"),
            Err(RpcError::Configuration { .. })
        ));
        assert!(matches!(
            ClientOptions::from_toml_str("selector = \"random\""),
            Err(RpcError::Configuration { .. })
        ));
    }
}
