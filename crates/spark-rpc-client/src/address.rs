use std::{fmt, str::FromStr, sync::Arc};

use crate::error::RpcError;

/// 远端服务实例的 `host:port` 地址。
///
/// - 主机部分保持原样（域名或 IP 字面量），解析由传输层负责；
/// - IPv6 字面量以 `[::1]:9000` 的形式书写。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteAddress {
    host: Arc<str>,
    port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for RemoteAddress {
    type Err = RpcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || RpcError::Configuration {
            detail: format!("invalid remote address `{value}`, expected host:port"),
        };
        let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for RemoteAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
