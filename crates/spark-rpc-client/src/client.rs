//! # RpcClient：调用分发门面
//!
//! ## 角色定位（Why）
//! - 应用代码只面对“接口名 + 方法名 + 消息体”，不接触连接、选址与响应匹配；
//! - 门面把注册表、超时调度器与连接监管器组合为一个实例，三者的生命周期随实例结束，
//!   进程内可以并存多个互不干扰的客户端。
//!
//! ## 调用流程（How）
//! 1. 编码消息体（失败直接返回 `Err`，不登记任何状态）；
//! 2. 生成关联标识并登记挂起调用，超时计时从此刻开始；
//! 3. 等待接口闸门（最长到调用截止时间），选址并取得通道；选中地址恰好被摘除时重选一次；
//! 4. 写出请求；选路或写出失败立即以失败完成该调用。
//!
//! ## 契约（What）
//! - 接口在截止时间前始终没有可达地址时，调用由超时收场；
//! - [`RpcClient::shutdown`] 之后的新调用返回 [`RpcError::Shutdown`]，在途调用以同一错误完成。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::Poll,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    address::RemoteAddress,
    call::{PendingCall, PendingCallRegistry, ResponseCallback},
    config::ClientOptions,
    connection::{ConnectOutcome, ConnectionSupervisor},
    discovery::DiscoveryEvent,
    error::{RpcError, RpcResult},
    id::CorrelationIdGenerator,
    message::{Decode, Encode, OutboundRequest},
    selector::AddressSelector,
    timer::TimeoutScheduler,
    transport::{Channel, Connector, TransportListener},
};

struct ClientInner {
    options: ClientOptions,
    ids: CorrelationIdGenerator,
    scheduler: Arc<TimeoutScheduler>,
    registry: PendingCallRegistry,
    supervisor: ConnectionSupervisor,
    shut_down: AtomicBool,
}

impl ClientInner {
    fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        let failed = self.registry.close();
        let closed = self.supervisor.close_all();
        self.scheduler.shutdown();
        tracing::info!(failed_calls = failed, closed_channels = closed, "rpc client shut down");
        true
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 传输层事件回送到客户端；只持有弱引用，客户端释放后事件被丢弃。
struct ClientListener {
    inner: Weak<ClientInner>,
}

impl TransportListener for ClientListener {
    fn on_response(&self, id: &str, payload: Bytes) {
        if let Some(inner) = self.inner.upgrade() {
            inner.registry.resolve_success(id, payload);
        }
    }

    fn on_response_error(&self, id: &str, error: RpcError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.registry.resolve_failure(id, error);
        }
    }

    fn on_disconnected(&self, address: &RemoteAddress) {
        if let Some(inner) = self.inner.upgrade() {
            inner.supervisor.on_disconnected(address);
        }
    }
}

/// RPC 客户端，克隆后共享同一实例。
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// 按配置中的选址策略构造客户端。
    pub fn new(options: ClientOptions, connector: Arc<dyn Connector>) -> RpcResult<Self> {
        let selector = options.selector.build();
        Self::with_selector(options, connector, selector)
    }

    /// 使用自定义选址策略构造客户端。
    ///
    /// # 错误
    /// - 配置校验失败：[`RpcError::Configuration`]；
    /// - 超时调度线程无法启动：[`RpcError::Runtime`]。
    pub fn with_selector(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        selector: Arc<dyn AddressSelector>,
    ) -> RpcResult<Self> {
        options.validate()?;
        let scheduler = Arc::new(TimeoutScheduler::start()?);
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let listener: Arc<dyn TransportListener> = Arc::new(ClientListener {
                inner: weak.clone(),
            });
            ClientInner {
                ids: CorrelationIdGenerator::new(),
                registry: PendingCallRegistry::new(Arc::clone(&scheduler)),
                supervisor: ConnectionSupervisor::new(
                    connector,
                    selector,
                    options.connect_options(),
                    listener,
                ),
                scheduler,
                options,
                shut_down: AtomicBool::new(false),
            }
        });
        Ok(Self { inner })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn registry(&self) -> &PendingCallRegistry {
        &self.inner.registry
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.inner.supervisor
    }

    /// 发出一次调用并返回其挂起句柄。
    ///
    /// 接口尚无可达地址时，当前线程最多阻塞到调用截止时间。
    ///
    /// # 错误
    /// - 消息体编码失败：[`RpcError::Codec`]，此时不会登记调用；
    /// - 客户端已关闭：[`RpcError::Shutdown`]。
    pub fn send<M>(
        &self,
        interface: &str,
        method: &str,
        request: &M,
        timeout: Duration,
        callback: Option<Box<dyn ResponseCallback>>,
    ) -> RpcResult<PendingCall>
    where
        M: Encode + ?Sized,
    {
        self.send_routed(interface, method, None, request, timeout, callback)
    }

    /// 带路由键的调用，路由键交给选址策略（如一致性哈希）。
    pub fn send_with_key<M>(
        &self,
        interface: &str,
        method: &str,
        key: &[u8],
        request: &M,
        timeout: Duration,
        callback: Option<Box<dyn ResponseCallback>>,
    ) -> RpcResult<PendingCall>
    where
        M: Encode + ?Sized,
    {
        self.send_routed(interface, method, Some(key), request, timeout, callback)
    }

    /// 异步版本：等待接口闸门时不占用线程。
    pub async fn send_async<M>(
        &self,
        interface: &str,
        method: &str,
        request: &M,
        timeout: Duration,
        callback: Option<Box<dyn ResponseCallback>>,
    ) -> RpcResult<PendingCall>
    where
        M: Encode + ?Sized,
    {
        let (call, outbound) = self.prepare(interface, method, request, timeout, callback)?;
        let mut opened = self.inner.supervisor.gate(interface).opened();
        let mut settled = call.clone();
        // 闸门打开与调用完成（通常是超时）谁先发生取谁。
        let ready = std::future::poll_fn(|cx| {
            if Pin::new(&mut settled).poll(cx).is_ready() {
                return Poll::Ready(false);
            }
            Pin::new(&mut opened).poll(cx).map(|()| true)
        })
        .await;
        if ready {
            let channel = self.pick_with_retry(interface, None);
            self.dispatch(&call, channel, outbound);
        }
        Ok(call)
    }

    /// 以配置的默认超时发出调用，阻塞等待并解码响应。
    ///
    /// # 错误
    /// - 调用失败或超时：返回完成该调用的原始错误；
    /// - 响应体解码失败：[`RpcError::Codec`]。
    pub fn call<M, R>(&self, interface: &str, method: &str, request: &M) -> RpcResult<R>
    where
        M: Encode + ?Sized,
        R: Decode,
    {
        let call = self.send(
            interface,
            method,
            request,
            self.inner.options.read_timeout(),
            None,
        )?;
        let response = call.wait();
        if let Some(error) = call.error() {
            return Err(error);
        }
        response.decode()
    }

    /// 应用一条服务发现事件。
    pub async fn apply_discovery_event(&self, event: DiscoveryEvent) -> RpcResult<()> {
        self.ensure_running()?;
        tracing::debug!(event = %event, "applying discovery event");
        match &event {
            DiscoveryEvent::AddressAdded { interface, address } => {
                let outcome = self
                    .inner
                    .supervisor
                    .add_connection(interface, address)
                    .await?;
                if outcome == ConnectOutcome::Withdrawn {
                    tracing::debug!(event = %event, "address withdrawn before handshake completed");
                }
            }
            DiscoveryEvent::AddressRemoved { interface, address } => {
                self.inner.supervisor.remove_connection(interface, address);
            }
        }
        Ok(())
    }

    /// 关闭客户端：在途调用以 [`RpcError::Shutdown`] 完成，关闭全部连接并停止超时调度线程。
    ///
    /// 重复调用无副作用，返回本次是否执行了关闭。
    pub fn shutdown(&self) -> bool {
        self.inner.shutdown()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn send_routed<M>(
        &self,
        interface: &str,
        method: &str,
        key: Option<&[u8]>,
        request: &M,
        timeout: Duration,
        callback: Option<Box<dyn ResponseCallback>>,
    ) -> RpcResult<PendingCall>
    where
        M: Encode + ?Sized,
    {
        let (call, outbound) = self.prepare(interface, method, request, timeout, callback)?;
        let gate = self.inner.supervisor.gate(interface);
        let ready = match call.deadline() {
            Some(deadline) => gate.wait_for(deadline.saturating_duration_since(Instant::now())),
            None => {
                gate.wait();
                true
            }
        };
        if ready {
            let channel = self.pick_with_retry(interface, key);
            self.dispatch(&call, channel, outbound);
        } else {
            tracing::debug!(correlation_id = %call.id(), interface, "interface not ready before deadline");
        }
        Ok(call)
    }

    fn prepare<M>(
        &self,
        interface: &str,
        method: &str,
        request: &M,
        timeout: Duration,
        callback: Option<Box<dyn ResponseCallback>>,
    ) -> RpcResult<(PendingCall, OutboundRequest)>
    where
        M: Encode + ?Sized,
    {
        self.ensure_running()?;
        let body = request.to_bytes()?;
        let id = self.inner.ids.next_id();
        let call = self.inner.registry.register(id.clone(), timeout, callback)?;
        Ok((
            call,
            OutboundRequest {
                correlation_id: id,
                interface: interface.to_owned(),
                method: method.to_owned(),
                body,
            },
        ))
    }

    fn pick_with_retry(&self, interface: &str, key: Option<&[u8]>) -> RpcResult<Arc<dyn Channel>> {
        match self.inner.supervisor.pick(interface, key) {
            Err(RpcError::NoReachableAddress { .. }) if !self.is_shut_down() => {
                tracing::debug!(interface, "selected address vanished, selecting again");
                self.inner.supervisor.pick(interface, key)
            }
            other => other,
        }
    }

    fn dispatch(
        &self,
        call: &PendingCall,
        channel: RpcResult<Arc<dyn Channel>>,
        request: OutboundRequest,
    ) {
        let written = channel.and_then(|channel| channel.send(request));
        if let Err(error) = written {
            let error = if self.is_shut_down() {
                RpcError::Shutdown
            } else {
                error
            };
            tracing::debug!(correlation_id = %call.id(), code = error.code(), "dispatch failed");
            self.inner.registry.resolve_failure(call.id().as_str(), error);
        }
    }

    fn ensure_running(&self) -> RpcResult<()> {
        if self.is_shut_down() {
            return Err(RpcError::Shutdown);
        }
        Ok(())
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending", &self.inner.registry.len())
            .field("supervisor", &self.inner.supervisor)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
