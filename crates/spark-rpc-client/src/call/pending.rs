//! # PendingCall：挂起调用的统一完成原语
//!
//! ## 行为契约（What）
//! - 状态机 `Pending → {Succeeded, Failed, TimedOut}`，三个终态均不可再迁移；
//! - 同一个句柄同时提供阻塞等待（[`PendingCall::wait`]、[`PendingCall::wait_timeout`]）、
//!   订阅式回调（[`PendingCall::subscribe`]）与 `Future` 轮询，三者观察到的是同一次完成；
//! - 等待方永远拿到结构化的 [`RpcResponse`]：失败与超时以哨兵响应呈现，不会返回 `Err`。
//!
//! ## 实现要点（How）
//! - 内部状态由 `parking_lot::Mutex` 保护，条件变量唤醒阻塞线程，`Waker` 列表唤醒异步任务；
//! - 回调与唤醒在锁外执行，回调内部可以安全地再次访问该调用。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{ResultCode, RpcError},
    id::CorrelationId,
    message::RpcResponse,
};

/// 调用的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallState {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallState::Pending)
    }
}

/// 调用完成时的回调。
///
/// 闭包 `FnOnce(Result<RpcResponse, RpcError>)` 自动实现该 trait。
pub trait ResponseCallback: Send + 'static {
    fn on_success(self: Box<Self>, response: RpcResponse);

    fn on_failure(self: Box<Self>, error: RpcError);
}

impl<F> ResponseCallback for F
where
    F: FnOnce(Result<RpcResponse, RpcError>) + Send + 'static,
{
    fn on_success(self: Box<Self>, response: RpcResponse) {
        (*self)(Ok(response))
    }

    fn on_failure(self: Box<Self>, error: RpcError) {
        (*self)(Err(error))
    }
}

/// 注册表在摘除调用后交给 [`PendingCall::settle`] 的终局结果。
#[derive(Debug)]
pub(crate) enum Settlement {
    Success(RpcResponse),
    Failure(RpcError),
    Timeout,
}

struct Slot {
    state: CallState,
    response: Option<RpcResponse>,
    error: Option<RpcError>,
    callbacks: Vec<Box<dyn ResponseCallback>>,
    wakers: Vec<Waker>,
}

struct CallShared {
    id: CorrelationId,
    timeout: Duration,
    deadline: Option<Instant>,
    slot: Mutex<Slot>,
    settled: Condvar,
}

/// 一次在途请求的句柄，可自由克隆。
#[derive(Clone)]
pub struct PendingCall {
    shared: Arc<CallShared>,
}

impl PendingCall {
    pub(crate) fn new(
        id: CorrelationId,
        timeout: Duration,
        callback: Option<Box<dyn ResponseCallback>>,
    ) -> Self {
        Self {
            shared: Arc::new(CallShared {
                id,
                timeout,
                deadline: Instant::now().checked_add(timeout),
                slot: Mutex::new(Slot {
                    state: CallState::Pending,
                    response: None,
                    error: None,
                    callbacks: callback.into_iter().collect(),
                    wakers: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        &self.shared.id
    }

    /// 注册时给定的调用超时。
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// 调用截止时间；超时大到无法表示为时间点时为 `None`，调用只会被响应或关闭完成。
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    pub fn state(&self) -> CallState {
        self.shared.slot.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// 已完成时返回结果，否则返回 `None`，不阻塞。
    pub fn try_result(&self) -> Option<RpcResponse> {
        let slot = self.shared.slot.lock();
        self.terminal_response(&slot)
    }

    /// 失败或超时时的原始错误；成功或仍挂起时为 `None`。
    pub fn error(&self) -> Option<RpcError> {
        self.shared.slot.lock().error.clone()
    }

    /// 阻塞直到调用进入终态。
    pub fn wait(&self) -> RpcResponse {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(response) = self.terminal_response(&slot) {
                return response;
            }
            self.shared.settled.wait(&mut slot);
        }
    }

    /// 最多阻塞 `max_wait`。
    ///
    /// 等待时限先到时返回结果码为 [`ResultCode::WaitElapsed`] 的哨兵响应；调用本身仍留在注册表中，
    /// 之后依旧会被响应或自身的超时正常完成，调用方可以再次等待。
    /// `max_wait` 大到无法表示为时间点时等同于 [`wait`](Self::wait)。
    pub fn wait_timeout(&self, max_wait: Duration) -> RpcResponse {
        let Some(until) = Instant::now().checked_add(max_wait) else {
            return self.wait();
        };
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(response) = self.terminal_response(&slot) {
                return response;
            }
            if self.shared.settled.wait_until(&mut slot, until).timed_out() {
                if let Some(response) = self.terminal_response(&slot) {
                    return response;
                }
                tracing::debug!(correlation_id = %self.shared.id, ?max_wait, "wait elapsed before completion");
                return RpcResponse::with_code(
                    self.shared.id.clone(),
                    ResultCode::WaitElapsed,
                    format!("no result for call `{}` within {max_wait:?}", self.shared.id),
                );
            }
        }
    }

    /// 订阅完成事件；若已处于终态，回调在当前线程立即执行。
    pub fn subscribe<C>(&self, callback: C)
    where
        C: ResponseCallback,
    {
        let mut slot = self.shared.slot.lock();
        match slot.state {
            CallState::Pending => slot.callbacks.push(Box::new(callback)),
            CallState::Succeeded => {
                let response = slot.response.clone();
                drop(slot);
                if let Some(response) = response {
                    Box::new(callback).on_success(response);
                }
            }
            CallState::Failed | CallState::TimedOut => {
                let error = slot.error.clone();
                drop(slot);
                if let Some(error) = error {
                    Box::new(callback).on_failure(error);
                }
            }
        }
    }

    /// 写入终局结果；仅第一次生效，返回是否由本次调用完成。
    pub(crate) fn settle(&self, settlement: Settlement) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state.is_terminal() {
            return false;
        }
        match settlement {
            Settlement::Success(response) => {
                slot.state = CallState::Succeeded;
                slot.response = Some(response);
            }
            Settlement::Failure(error) => {
                slot.state = CallState::Failed;
                slot.error = Some(error);
            }
            Settlement::Timeout => {
                slot.state = CallState::TimedOut;
                slot.error = Some(RpcError::CallTimedOut {
                    id: self.shared.id.clone(),
                    timeout: self.shared.timeout,
                });
            }
        }
        let callbacks = std::mem::take(&mut slot.callbacks);
        let wakers = std::mem::take(&mut slot.wakers);
        let response = slot.response.clone();
        let error = slot.error.clone();
        drop(slot);

        self.shared.settled.notify_all();
        wakers.into_iter().for_each(Waker::wake);
        for callback in callbacks {
            match (&response, &error) {
                (Some(response), _) => callback.on_success(response.clone()),
                (None, Some(error)) => callback.on_failure(error.clone()),
                (None, None) => {}
            }
        }
        true
    }

    fn terminal_response(&self, slot: &Slot) -> Option<RpcResponse> {
        match slot.state {
            CallState::Pending => None,
            CallState::Succeeded => slot.response.clone(),
            CallState::Failed | CallState::TimedOut => slot
                .error
                .as_ref()
                .map(|error| RpcResponse::sentinel(self.shared.id.clone(), error)),
        }
    }
}

/// 以 `Future` 形式等待；丢弃该 Future 不会影响调用本身。
impl Future for PendingCall {
    type Output = RpcResponse;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        if let Some(response) = self.terminal_response(&slot) {
            return Poll::Ready(response);
        }
        if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("timeout", &self.shared.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    fn call(id: &str) -> PendingCall {
        PendingCall::new(CorrelationId::from(id), Duration::from_secs(5), None)
    }

    #[test]
    fn first_settlement_wins() {
        let call = call("p-1");
        let response = RpcResponse::success(call.id().clone(), Bytes::from_static(b"ok"));
        assert!(call.settle(Settlement::Success(response.clone())));
        assert!(!call.settle(Settlement::Timeout));
        assert!(!call.settle(Settlement::Failure(RpcError::Shutdown)));
        assert_eq!(call.state(), CallState::Succeeded);
        assert_eq!(call.wait(), response);
    }

    #[test]
    fn timeout_settlement_yields_sentinel() {
        let call = call("p-2");
        assert!(call.settle(Settlement::Timeout));
        let response = call.wait();
        assert_eq!(response.code(), ResultCode::Timeout);
        assert_eq!(call.state(), CallState::TimedOut);
    }

    #[test]
    fn wait_timeout_leaves_call_pending() {
        let call = call("p-3");
        let response = call.wait_timeout(Duration::from_millis(10));
        assert_eq!(response.code(), ResultCode::WaitElapsed);
        assert_eq!(call.state(), CallState::Pending);

        assert!(call.settle(Settlement::Failure(RpcError::Transport {
            detail: "reset".into(),
        })));
        assert_eq!(call.wait_timeout(Duration::from_millis(10)).code(), ResultCode::Failure);
    }

    #[test]
    fn blocked_waiter_is_released_by_other_thread() {
        let call = call("p-4");
        let waiter = {
            let call = call.clone();
            thread::spawn(move || call.wait())
        };
        thread::sleep(Duration::from_millis(10));
        let response = RpcResponse::success(call.id().clone(), Bytes::from_static(b"late"));
        call.settle(Settlement::Success(response.clone()));
        assert_eq!(waiter.join().expect("waiter thread"), response);
    }

    #[test]
    fn callbacks_run_once_including_late_subscribers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let call = PendingCall::new(
            CorrelationId::from("p-5"),
            Duration::from_secs(5),
            Some(Box::new(move |result: Result<RpcResponse, RpcError>| {
                assert!(result.is_err());
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        call.settle(Settlement::Failure(RpcError::Shutdown));
        call.settle(Settlement::Timeout);

        let late = Arc::clone(&hits);
        call.subscribe(move |result: Result<RpcResponse, RpcError>| {
            assert_eq!(result, Err(RpcError::Shutdown));
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn future_completes_after_settlement() {
        let call = call("p-6");
        let settler = {
            let call = call.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                call.settle(Settlement::Success(RpcResponse::success(
                    call.id().clone(),
                    Bytes::from_static(b"async"),
                )));
            })
        };
        let response = futures::executor::block_on(call.clone());
        settler.join().expect("settler thread");
        assert_eq!(response.body().as_ref(), b"async");
    }
}
