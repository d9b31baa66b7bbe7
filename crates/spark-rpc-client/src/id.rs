//! 关联标识（Correlation-ID）及其生成器。
//!
//! - `CorrelationId` 内部使用 `Arc<str>`，在注册表、超时任务与传输层之间克隆时只增加引用计数；
//! - `CorrelationIdGenerator` 为每个客户端实例分配独立前缀，保证同一进程内多个客户端并存时
//!   生成的标识互不冲突。

use std::{
    borrow::Borrow,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// 将一次出站请求与其入站响应关联起来的不透明标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// 由任意字符串构造标识。
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// 以 `&str` 形式读取标识。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// 单调递增的关联标识生成器，形如 `c{client}-{sequence}`。
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    client: u64,
    next: AtomicU64,
}

impl CorrelationIdGenerator {
    /// 领取新的客户端前缀，序号从 1 开始。
    pub fn new() -> Self {
        Self {
            client: NEXT_CLIENT.fetch_add(1, Ordering::Relaxed),
            next: AtomicU64::new(1),
        }
    }

    /// 生成下一个标识。
    pub fn next_id(&self) -> CorrelationId {
        let sequence = self.next.fetch_add(1, Ordering::Relaxed);
        CorrelationId::new(format!("c{}-{sequence}", self.client))
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
