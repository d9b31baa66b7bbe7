use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use socket2::SockRef;
use spark_rpc_client::{
    Channel, ConnectOptions, Connector, RemoteAddress, RpcError, RpcResult, TransportListener,
};
use tokio::{
    net::{TcpSocket, TcpStream, lookup_host},
    runtime::Handle,
};
use tracing::debug;

use crate::{
    channel::TcpChannel,
    error::{self, TransportError, map_io_error, timeout_error},
};

/// 基于 Tokio 的建连实现。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 客户端核心不绑定运行时，调用方可能在任意执行器上等待建连结果；
///   因此所有 IO 都投递到持有的 [`Handle`] 上执行，调用方只等待任务结果。
///
/// ## 逻辑 (How)
/// 1. 解析主机名，取第一个地址；
/// 2. 按地址族创建 `TcpSocket`，应用 `SO_REUSEADDR` 与收发缓冲区大小；
/// 3. 在 `connect_timeout` 内完成握手；
/// 4. 设置 `TCP_NODELAY` 与 `SO_KEEPALIVE`，交给 [`TcpChannel`] 启动读写任务。
///
/// ## 契约 (What)
/// - 任一步骤失败都以 [`TransportError`] 描述，再转换为 [`RpcError`] 返回；
///   监管器负责把它包装为建连失败。
#[derive(Clone, Debug)]
pub struct TcpConnector {
    handle: Handle,
}

impl TcpConnector {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// 绑定当前线程所在的 Tokio 运行时。
    pub fn current() -> Result<Self, TransportError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| TransportError::RuntimeUnavailable {
                detail: err.to_string(),
            })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &RemoteAddress,
        options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> RpcResult<Arc<dyn Channel>> {
        let task = self
            .handle
            .spawn(open(address.clone(), options.clone(), listener));
        match task.await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(err)) => Err(err.into()),
            Err(err) => Err(RpcError::from(TransportError::RuntimeUnavailable {
                detail: format!("connect task did not complete: {err}"),
            })),
        }
    }
}

async fn open(
    address: RemoteAddress,
    options: ConnectOptions,
    listener: Arc<dyn TransportListener>,
) -> Result<Arc<dyn Channel>, TransportError> {
    let target = resolve(&address).await?;
    let socket = configure_socket(target, &options)?;
    let stream = tokio::time::timeout(options.connect_timeout, socket.connect(target))
        .await
        .map_err(|_| timeout_error(error::CONNECT, options.connect_timeout))?
        .map_err(|err| map_io_error(error::CONNECT, err))?;
    tune_stream(&stream, &options)?;
    debug!(%address, peer = %target, "tcp connection established");
    let channel: Arc<dyn Channel> =
        TcpChannel::spawn(stream, address, options.max_frame_len, listener);
    Ok(channel)
}

async fn resolve(address: &RemoteAddress) -> Result<SocketAddr, TransportError> {
    let mut candidates = lookup_host((address.host(), address.port()))
        .await
        .map_err(|err| map_io_error(error::RESOLVE, err))?;
    candidates.next().ok_or_else(|| TransportError::Io {
        code: error::RESOLVE.code,
        message: format!("{}: no address found for {address}", error::RESOLVE.message),
        retryable: false,
    })
}

fn configure_socket(
    target: SocketAddr,
    options: &ConnectOptions,
) -> Result<TcpSocket, TransportError> {
    let configure = |err: io::Error| map_io_error(error::CONFIGURE, err);
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(configure)?;
    socket.set_reuseaddr(options.reuse_addr).map_err(configure)?;
    if let Some(size) = options.receive_buffer_size {
        socket
            .set_recv_buffer_size(clamp_buffer(size))
            .map_err(configure)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket
            .set_send_buffer_size(clamp_buffer(size))
            .map_err(configure)?;
    }
    Ok(socket)
}

fn tune_stream(stream: &TcpStream, options: &ConnectOptions) -> Result<(), TransportError> {
    let configure = |err: io::Error| map_io_error(error::CONFIGURE, err);
    stream.set_nodelay(options.tcp_no_delay).map_err(configure)?;
    SockRef::from(stream)
        .set_keepalive(options.keep_alive)
        .map_err(configure)
}

fn clamp_buffer(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}
