use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::{Bytes, BytesMut};
use spark_rpc_client::{
    Channel, OutboundRequest, RemoteAddress, RpcError, RpcResult, TransportListener,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{
        Notify,
        mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
    },
};
use tracing::{debug, warn};

use crate::{
    error::{self, TransportError, map_io_error},
    frame::{Frame, FrameDecoder},
};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Close,
}

#[derive(Debug)]
struct ChannelState {
    address: RemoteAddress,
    active: AtomicBool,
    stop_reading: Notify,
}

impl ChannelState {
    /// 首次由活跃转为非活跃时返回 `true`，只有这一方负责上报断连。
    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// 一条 TCP 连接上的请求通道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 调用方线程不应被套接字写阻塞，因此 `send` 只做编码与入队；
/// - 响应到达的时机与调用方无关，需要独立任务持续读取并回送给客户端核心。
///
/// ## 逻辑 (How)
/// - 建连后 `TcpStream::into_split` 拆为读写两半，各由一个 Tokio 任务持有；
/// - 写任务按入队顺序 `write_all`，收到关闭指令后关闭写半部并通知读任务退出；
/// - 读任务以 [`FrameDecoder`] 增量解帧，响应帧交给 [`TransportListener::on_response`]，
///   错误帧转为 [`RpcError::Remote`]；
/// - 对端关闭、读写失败或收到非法帧时，先将通道标记为非活跃，再上报 `on_disconnected`。
///
/// ## 契约 (What)
/// - `send` 在通道已关闭时返回传输错误，帧超过 `max_frame_len` 时返回编解码错误且不入队；
/// - `close` 幂等，已入队的帧会先写出；主动关闭不会触发断连上报。
#[derive(Debug)]
pub struct TcpChannel {
    state: Arc<ChannelState>,
    outbound: UnboundedSender<Outbound>,
    max_frame_len: usize,
}

impl TcpChannel {
    /// 接管已建立的连接并启动读写任务，必须在 Tokio 运行时内调用。
    pub(crate) fn spawn(
        stream: TcpStream,
        address: RemoteAddress,
        max_frame_len: usize,
        listener: Arc<dyn TransportListener>,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState {
            address,
            active: AtomicBool::new(true),
            stop_reading: Notify::new(),
        });

        tokio::spawn(write_loop(
            writer,
            queue,
            Arc::clone(&state),
            Arc::clone(&listener),
        ));
        tokio::spawn(read_loop(
            reader,
            FrameDecoder::new(max_frame_len),
            Arc::clone(&state),
            outbound.downgrade(),
            listener,
        ));

        Arc::new(Self {
            state,
            outbound,
            max_frame_len,
        })
    }

    fn closed() -> RpcError {
        TransportError::Closed.into()
    }
}

impl Channel for TcpChannel {
    fn remote_address(&self) -> &RemoteAddress {
        &self.state.address
    }

    fn send(&self, request: OutboundRequest) -> RpcResult<()> {
        if !self.is_active() {
            return Err(Self::closed());
        }
        let mut buffer = BytesMut::new();
        Frame::from(request).encode(self.max_frame_len, &mut buffer)?;
        self.outbound
            .send(Outbound::Frame(buffer.freeze()))
            .map_err(|_| Self::closed())
    }

    fn close(&self) {
        if self.state.deactivate() {
            debug!(address = %self.state.address, "closing tcp channel");
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: UnboundedReceiver<Outbound>,
    state: Arc<ChannelState>,
    listener: Arc<dyn TransportListener>,
) {
    while let Some(message) = queue.recv().await {
        let bytes = match message {
            Outbound::Frame(bytes) => bytes,
            Outbound::Close => break,
        };
        if let Err(err) = writer.write_all(&bytes).await {
            let err = map_io_error(error::WRITE, err);
            warn!(address = %state.address, code = err.code(), error = %err, "tcp write failed");
            state.stop_reading.notify_one();
            if state.deactivate() {
                listener.on_disconnected(&state.address);
            }
            return;
        }
    }
    // 关闭写半部前会冲刷已写入的数据。
    if let Err(err) = writer.shutdown().await {
        let err = map_io_error(error::SHUTDOWN, err);
        debug!(address = %state.address, code = err.code(), error = %err, "tcp shutdown failed");
    }
    state.stop_reading.notify_one();
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    decoder: FrameDecoder,
    state: Arc<ChannelState>,
    outbound: WeakUnboundedSender<Outbound>,
    listener: Arc<dyn TransportListener>,
) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let failure = loop {
        tokio::select! {
            _ = state.stop_reading.notified() => return,
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => break None,
                Ok(_) => {
                    if let Err(err) = deliver_frames(&decoder, &mut buffer, listener.as_ref()) {
                        break Some(err);
                    }
                }
                Err(err) => break Some(map_io_error(error::READ, err)),
            },
        }
    };

    match &failure {
        None => debug!(address = %state.address, "peer closed tcp connection"),
        Some(err) => warn!(address = %state.address, code = err.code(), error = %err, "tcp read failed"),
    }
    if let Some(sender) = outbound.upgrade() {
        let _ = sender.send(Outbound::Close);
    }
    if state.deactivate() {
        listener.on_disconnected(&state.address);
    }
}

fn deliver_frames(
    decoder: &FrameDecoder,
    buffer: &mut BytesMut,
    listener: &dyn TransportListener,
) -> Result<(), TransportError> {
    while let Some(frame) = decoder.decode(buffer)? {
        match frame {
            Frame::Response {
                correlation_id,
                body,
            } => listener.on_response(&correlation_id, body),
            Frame::Error {
                correlation_id,
                code,
                message,
            } => listener.on_response_error(&correlation_id, RpcError::Remote { code, message }),
            Frame::Request { correlation_id, .. } => {
                warn!(%correlation_id, "unexpected request frame from server dropped");
            }
        }
    }
    Ok(())
}
