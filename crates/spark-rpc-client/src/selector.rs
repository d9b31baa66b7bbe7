//! # 地址选择策略
//!
//! ## 行为契约（What）
//! - 输入为某接口当前可达的地址序列（保持插入顺序）与可选的路由键，输出其中一个地址；
//! - 策略只读取序列，不修改；空序列返回 `None`，由调用方映射为不可达错误。
//!
//! ## 内置策略（How）
//! - [`FirstAvailable`]：总是取第一个地址，默认策略；
//! - [`RoundRobin`]：原子游标轮转，跨线程共享同一游标；
//! - [`ConsistentHash`]：按路由键做最高随机权重（rendezvous）哈希，键相同且地址集合不变时结果稳定，
//!   地址增删只影响落在该地址上的键。

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{address::RemoteAddress, error::RpcError};

/// 地址选择策略。
pub trait AddressSelector: Send + Sync + fmt::Debug {
    fn select<'a>(
        &self,
        addresses: &'a [RemoteAddress],
        key: Option<&[u8]>,
    ) -> Option<&'a RemoteAddress>;

    /// 策略名称，用于日志。
    fn name(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FirstAvailable;

impl AddressSelector for FirstAvailable {
    fn select<'a>(
        &self,
        addresses: &'a [RemoteAddress],
        _key: Option<&[u8]>,
    ) -> Option<&'a RemoteAddress> {
        addresses.first()
    }

    fn name(&self) -> &'static str {
        "first-available"
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressSelector for RoundRobin {
    fn select<'a>(
        &self,
        addresses: &'a [RemoteAddress],
        _key: Option<&[u8]>,
    ) -> Option<&'a RemoteAddress> {
        if addresses.is_empty() {
            return None;
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        addresses.get(turn % addresses.len())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConsistentHash;

impl ConsistentHash {
    fn weight(key: &[u8], address: &RemoteAddress) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update([0u8]);
        hasher.update(address.host().as_bytes());
        hasher.update(address.port().to_be_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

impl AddressSelector for ConsistentHash {
    fn select<'a>(
        &self,
        addresses: &'a [RemoteAddress],
        key: Option<&[u8]>,
    ) -> Option<&'a RemoteAddress> {
        let Some(key) = key else {
            return addresses.first();
        };
        // 权重相同时保留靠前的地址。
        addresses
            .iter()
            .map(|address| (Self::weight(key, address), address))
            .fold(None, |best: Option<(u64, &RemoteAddress)>, candidate| match best {
                Some(current) if current.0 >= candidate.0 => Some(current),
                _ => Some(candidate),
            })
            .map(|(_, address)| address)
    }

    fn name(&self) -> &'static str {
        "consistent-hash"
    }
}

/// 配置层可选的策略种类。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorKind {
    #[default]
    FirstAvailable,
    RoundRobin,
    ConsistentHash,
}

impl SelectorKind {
    pub fn build(self) -> Arc<dyn AddressSelector> {
        match self {
            SelectorKind::FirstAvailable => Arc::new(FirstAvailable),
            SelectorKind::RoundRobin => Arc::new(RoundRobin::new()),
            SelectorKind::ConsistentHash => Arc::new(ConsistentHash),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SelectorKind::FirstAvailable => "first-available",
            SelectorKind::RoundRobin => "round-robin",
            SelectorKind::ConsistentHash => "consistent-hash",
        }
    }
}

impl FromStr for SelectorKind {
    type Err = RpcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "first-available" => Ok(SelectorKind::FirstAvailable),
            "round-robin" => Ok(SelectorKind::RoundRobin),
            "consistent-hash" => Ok(SelectorKind::ConsistentHash),
            other => Err(RpcError::Configuration {
                detail: format!("unknown selector `{other}`"),
            }),
        }
    }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
