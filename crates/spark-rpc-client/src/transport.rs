//! # 传输层协作契约
//!
//! ## 角色定位（Why）
//! - 客户端核心只负责关联、超时与连接簿记，字节如何上线由传输实现决定；
//! - 本模块定义两侧之间的全部接缝：核心向传输层索取 [`Channel`]（经由 [`Connector`]），
//!   传输层通过 [`TransportListener`] 把响应与断连事件送回核心。
//!
//! ## 契约（What）
//! - `Connector::connect` 的 `Ok` / `Err` 即“建连成功 / 建连失败”两种通知；
//! - `Channel::send` 不得阻塞调用线程，写出失败以 `Err` 同步返回或在之后通过断连事件体现；
//! - 传输层在调用 `on_disconnected` 之前必须先让对应通道的 `is_active()` 返回 `false`，
//!   监管器据此区分过期通知与当前连接的断开。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    address::RemoteAddress,
    config::ConnectOptions,
    error::{RpcError, RpcResult},
    message::OutboundRequest,
};

/// 一条已建立的连接。
pub trait Channel: Send + Sync + fmt::Debug {
    fn remote_address(&self) -> &RemoteAddress;

    /// 写出一次请求。
    fn send(&self, request: OutboundRequest) -> RpcResult<()>;

    /// 优雅关闭：已排队的写出先冲刷，再关闭连接。重复调用无副作用。
    fn close(&self);

    fn is_active(&self) -> bool;
}

/// 建连能力。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        address: &RemoteAddress,
        options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> RpcResult<Arc<dyn Channel>>;
}

/// 传输层回送给客户端核心的事件。
pub trait TransportListener: Send + Sync + 'static {
    /// 收到关联标识为 `id` 的成功响应。
    fn on_response(&self, id: &str, payload: Bytes);

    /// 收到关联标识为 `id` 的失败响应。
    fn on_response_error(&self, id: &str, error: RpcError);

    fn on_disconnected(&self, address: &RemoteAddress);
}
