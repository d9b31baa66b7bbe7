//! # spark-rpc-client
//!
//! ## 定位与职责（Why）
//! - RPC 客户端运行时：把“发出即忘”的网络写出变成可等待、可订阅、带超时的挂起调用，
//!   并按远端接口维护连接池、在可达地址之间按策略选址；
//! - 传输细节（帧格式、套接字）通过 [`transport`] 中的 trait 接入，核心不绑定任何异步运行时。
//!
//! ## 架构嵌入（Where）
//! - [`call`]：挂起调用与注册表，负责请求与响应的关联及恰好一次完成；
//! - [`timer`]：单线程截止时间堆，为每个挂起调用提供可取消的超时；
//! - [`connection`]：连接监管器、服务目录与按接口划分的就绪闸门；
//! - [`selector`]：地址选择策略；
//! - [`client`]：组合以上组件的调用分发门面 [`RpcClient`]。
//!
//! ## Feature 策略（Trade-offs）
//! - `json`：为消息体提供基于 `serde_json` 的 [`message::Json`] 适配。

/// 远端实例地址。
pub mod address;

/// 挂起调用与注册表。
///
/// - **意图说明 (Why)**：为每次请求提供唯一的完成点，响应、失败与超时三者只有一个生效；
/// - **契约定位 (What)**：完成路径统一为原子摘除，晚到的结果静默丢弃。
pub mod call;

/// 调用分发门面。
pub mod client;

/// 客户端配置与建连参数。
pub mod config;

/// 连接监管：连接表、服务目录与就绪闸门。
///
/// - **意图说明 (Why)**：同一地址只建一条连接，新接口在拿到首个地址前阻塞选路调用方；
/// - **风险提示 (Trade-offs)**：建连失败只返回给发起方，目录与闸门不受影响。
pub mod connection;

/// 服务发现事件。
pub mod discovery;

/// 错误类型与结果码集中声明处。
pub mod error;

/// 关联标识。
pub mod id;

/// 消息体编解码契约与结构化响应。
pub mod message;

/// 地址选择策略。
pub mod selector;

/// 日志初始化。
pub mod telemetry;

/// 超时调度。
pub mod timer;

/// 传输层协作契约。
pub mod transport;

pub use address::RemoteAddress;
pub use call::{CallState, PendingCall, PendingCallRegistry, ResponseCallback};
pub use client::RpcClient;
pub use config::{ClientOptions, ConnectOptions};
pub use connection::{ConnectOutcome, ConnectionStatus, ConnectionSupervisor, ReadinessGate};
pub use discovery::DiscoveryEvent;
pub use error::{ResultCode, RpcError, RpcResult};
pub use id::{CorrelationId, CorrelationIdGenerator};
pub use message::{Decode, Encode, OutboundRequest, RpcResponse};
pub use selector::{AddressSelector, ConsistentHash, FirstAvailable, RoundRobin, SelectorKind};
pub use timer::{TimeoutHandle, TimeoutScheduler};
pub use transport::{Channel, Connector, TransportListener};
