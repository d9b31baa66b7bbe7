//! # PendingCallRegistry：关联标识到挂起调用的并发映射
//!
//! ## 角色定位（Why）
//! - 网络写出是“发出即忘”的，响应稍后在传输线程上按关联标识到达；注册表负责把两者重新对上，
//!   并保证每个调用恰好完成一次；
//! - 与超时调度器配合：每个注册都绑定一个超时任务，截止时间到达仍未完成的调用以超时收场。
//!
//! ## 并发契约（What）
//! - 完成路径（成功/失败/超时）统一采用 `DashMap::remove` 原子摘除，谁摘到谁完成，其余一律空操作；
//! - 超时句柄在 `entry()` 预留的槽位内创建，任何取消路径看到条目时句柄必然已经存在；
//! - 关闭后新的注册直接返回 [`RpcError::Shutdown`]。
//!
//! ## 风险提示（Trade-offs）
//! - 超时回调只持有注册表的 `Weak` 引用，注册表释放后残留的定时任务触发时自动失效。

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    call::pending::{PendingCall, ResponseCallback, Settlement},
    error::{RpcError, RpcResult},
    id::CorrelationId,
    message::RpcResponse,
    timer::{TimeoutHandle, TimeoutScheduler},
};

struct RegistryEntry {
    call: PendingCall,
    timer: TimeoutHandle,
}

struct RegistryInner {
    calls: DashMap<CorrelationId, RegistryEntry>,
    scheduler: Arc<TimeoutScheduler>,
    closed: AtomicBool,
}

impl RegistryInner {
    fn take(&self, id: &str) -> Option<(CorrelationId, RegistryEntry)> {
        let removed = self.calls.remove(id);
        if let Some((_, entry)) = &removed {
            entry.timer.cancel();
        }
        removed
    }

    fn expire(&self, id: &str) -> bool {
        match self.take(id) {
            Some((id, entry)) => {
                tracing::debug!(correlation_id = %id, timeout = ?entry.call.timeout(), "pending call timed out");
                entry.call.settle(Settlement::Timeout)
            }
            None => false,
        }
    }
}

/// 挂起调用注册表，克隆后共享同一张表。
#[derive(Clone)]
pub struct PendingCallRegistry {
    inner: Arc<RegistryInner>,
}

impl PendingCallRegistry {
    pub fn new(scheduler: Arc<TimeoutScheduler>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                calls: DashMap::new(),
                scheduler,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 登记一个挂起调用并安排超时。
    ///
    /// # 错误
    /// - `id` 仍在挂起：[`RpcError::DuplicateCorrelationId`]；
    /// - 注册表已关闭：[`RpcError::Shutdown`]。
    pub fn register(
        &self,
        id: CorrelationId,
        timeout: Duration,
        callback: Option<Box<dyn ResponseCallback>>,
    ) -> RpcResult<PendingCall> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        let call = match self.inner.calls.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateCorrelationId { id }),
            Entry::Vacant(slot) => {
                let call = PendingCall::new(id.clone(), timeout, callback);
                let registry = Arc::downgrade(&self.inner);
                let timer_id = id.clone();
                let timer = self.inner.scheduler.schedule(timeout, move || {
                    if let Some(inner) = Weak::upgrade(&registry) {
                        inner.expire(timer_id.as_str());
                    }
                });
                slot.insert(RegistryEntry {
                    call: call.clone(),
                    timer,
                });
                call
            }
        };
        tracing::debug!(correlation_id = %id, ?timeout, "pending call registered");

        // 与 `fail_all` 交错时，关闭标志可能在上面的检查之后才置位。
        if self.inner.closed.load(Ordering::Acquire)
            && let Some((_, entry)) = self.inner.take(id.as_str())
        {
            entry.call.settle(Settlement::Failure(RpcError::Shutdown));
            return Err(RpcError::Shutdown);
        }
        Ok(call)
    }

    /// 以远端成功响应完成调用；返回本次是否生效。
    pub fn resolve_success(&self, id: &str, body: Bytes) -> bool {
        match self.inner.take(id) {
            Some((id, entry)) => {
                tracing::debug!(correlation_id = %id, "pending call resolved");
                entry
                    .call
                    .settle(Settlement::Success(RpcResponse::success(id, body)))
            }
            None => {
                tracing::debug!(correlation_id = %id, "late or unknown response dropped");
                false
            }
        }
    }

    /// 以失败完成调用；返回本次是否生效。
    pub fn resolve_failure(&self, id: &str, error: RpcError) -> bool {
        match self.inner.take(id) {
            Some((id, entry)) => {
                tracing::debug!(correlation_id = %id, code = error.code(), "pending call failed");
                entry.call.settle(Settlement::Failure(error))
            }
            None => {
                tracing::debug!(correlation_id = %id, code = error.code(), "late or unknown failure dropped");
                false
            }
        }
    }

    /// 超时触发入口。
    ///
    /// 正常情况下只由调度器调用；公开出来是为了让上层在自有时钟下驱动超时。
    pub fn on_timeout_fire(&self, id: &str) -> bool {
        self.inner.expire(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.calls.is_empty()
    }

    /// 以同一个错误完成当前全部挂起调用，返回受影响的数量。
    pub fn fail_all(&self, error: RpcError) -> usize {
        let ids: Vec<CorrelationId> = self
            .inner
            .calls
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter(|id| self.resolve_failure(id.as_str(), error.clone()))
            .count()
    }

    /// 拒绝后续注册，并以 [`RpcError::Shutdown`] 完成全部挂起调用。
    pub fn close(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        self.fail_all(RpcError::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for PendingCallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCallRegistry")
            .field("pending", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
