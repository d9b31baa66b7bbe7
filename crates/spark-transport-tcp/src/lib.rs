#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：为 `spark-rpc-client` 提供基于 Tokio 的参考 TCP 传输，实现其
  [`Connector`](spark_rpc_client::Connector) 与 [`Channel`](spark_rpc_client::Channel) 契约。
- **架构角色**：客户端核心只负责关联、超时与连接簿记；本 crate 负责字节上线、
  解帧以及把响应与断连事件回送给 [`TransportListener`](spark_rpc_client::TransportListener)。

## 核心契约（What）
- **输入条件**：[`TcpConnector`] 需要一个 Tokio 运行时句柄，调用方本身可以运行在任意执行器上；
- **输出保障**：建连、读写与解帧失败均以带稳定错误码的 [`TransportError`] 描述，
  并可转换为 [`RpcError`](spark_rpc_client::RpcError)；
- **帧格式**：长度前缀帧，详见 [`frame`] 模块文档，单帧上限取自 `max_frame_len`。

## 实现策略（How）
- 每条连接拆为读写两半，各由一个任务持有，`send` 只负责编码和入队；
- 套接字选项（`SO_REUSEADDR`、缓冲区大小、`TCP_NODELAY`、`SO_KEEPALIVE`）在握手前后分别设置，
  其中 keep-alive 借助 `socket2::SockRef` 完成。

## 风险与考量（Trade-offs）
- 写队列无上界，背压依赖调用方的超时治理；
- 主机名解析只取第一个地址，不做多地址轮试。
"#]

mod channel;
mod connector;
mod error;
pub mod frame;

pub use channel::TcpChannel;
pub use connector::TcpConnector;
pub use error::TransportError;
pub use frame::{Frame, FrameDecoder};
