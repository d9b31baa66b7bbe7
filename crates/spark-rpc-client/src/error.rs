//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为客户端运行时的注册、建连、选址与调用结果提供集中定义的错误语义；
//! - 每个变体都有稳定错误码（[`RpcError::code`]）与响应结果码（[`RpcError::result_code`]），
//!   哨兵响应据此填写，调用方无需匹配错误文本。
//!
//! ## 设计要求（What）
//! - 所有变体均为 `Clone + Eq`：同一个失败需要同时交付给阻塞等待方与多个回调；
//! - 上下文字段使用 `String`/`Arc<str>` 承载，跨线程传播时保持 `Send + Sync + 'static`。

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{address::RemoteAddress, id::CorrelationId};

/// 客户端运行时的统一结果别名。
pub type RpcResult<T> = Result<T, RpcError>;

/// 客户端运行时错误域。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    /// 注册时发现同名关联标识仍处于挂起状态，属于调用方编程错误。
    #[error("correlation id `{id}` is already pending")]
    DuplicateCorrelationId { id: CorrelationId },

    /// 传输层建连失败；只返回给发起 `add_connection` 的调用方。
    #[error("failed to connect to {address}: {detail}")]
    ConnectionFailed {
        address: RemoteAddress,
        detail: String,
    },

    /// 调用在截止时间内没有收到响应。
    #[error("call `{id}` timed out after {timeout:?}")]
    CallTimedOut { id: CorrelationId, timeout: Duration },

    /// 选址与并发摘除之间的竞态：选中的地址已失去活跃连接。
    #[error("no reachable address for interface `{interface}`")]
    NoReachableAddress { interface: String },

    /// 有界等待就绪闸门超时。
    #[error("interface `{interface}` not ready after {waited:?}")]
    ReadinessTimeout { interface: String, waited: Duration },

    /// 重连一个连接表中不存在的地址。
    #[error("address {address} is not known to the connection table")]
    UnknownAddress { address: RemoteAddress },

    /// 写出请求或底层通道失败。
    #[error("transport failure: {detail}")]
    Transport { detail: String },

    /// 远端返回的应用层错误。
    #[error("remote error `{code}`: {message}")]
    Remote { code: String, message: String },

    /// 消息体编解码失败。
    #[error("codec failure: {detail}")]
    Codec { detail: String },

    /// 客户端已关闭，挂起调用被统一失败。
    #[error("client has been shut down")]
    Shutdown,

    /// 配置非法或无法解析。
    #[error("invalid configuration: {detail}")]
    Configuration { detail: String },

    /// 运行时资源（调度线程等）无法创建。
    #[error("runtime failure: {detail}")]
    Runtime { detail: String },
}

impl RpcError {
    /// 稳定错误码，供日志与指标聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::DuplicateCorrelationId { .. } => "rpc.call.duplicate_id",
            RpcError::ConnectionFailed { .. } => "rpc.connection.failed",
            RpcError::CallTimedOut { .. } => "rpc.call.timeout",
            RpcError::NoReachableAddress { .. } => "rpc.route.unreachable",
            RpcError::ReadinessTimeout { .. } => "rpc.route.not_ready",
            RpcError::UnknownAddress { .. } => "rpc.connection.unknown",
            RpcError::Transport { .. } => "rpc.transport.failure",
            RpcError::Remote { .. } => "rpc.remote.error",
            RpcError::Codec { .. } => "rpc.codec.failure",
            RpcError::Shutdown => "rpc.client.shutdown",
            RpcError::Configuration { .. } => "rpc.config.invalid",
            RpcError::Runtime { .. } => "rpc.runtime.failure",
        }
    }

    /// 该错误在哨兵响应中呈现的结果码。
    pub fn result_code(&self) -> ResultCode {
        match self {
            RpcError::CallTimedOut { .. } => ResultCode::Timeout,
            RpcError::ConnectionFailed { .. }
            | RpcError::NoReachableAddress { .. }
            | RpcError::ReadinessTimeout { .. }
            | RpcError::UnknownAddress { .. } => ResultCode::Unavailable,
            RpcError::Shutdown => ResultCode::Shutdown,
            RpcError::DuplicateCorrelationId { .. }
            | RpcError::Transport { .. }
            | RpcError::Remote { .. }
            | RpcError::Codec { .. }
            | RpcError::Configuration { .. }
            | RpcError::Runtime { .. } => ResultCode::Failure,
        }
    }

    /// 是否为超时合成的失败。
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::CallTimedOut { .. })
    }
}

/// 结构化响应携带的结果码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// 远端成功返回。
    Success,
    /// 传输、编解码或远端应用层失败。
    Failure,
    /// 调用超过截止时间。
    Timeout,
    /// 没有可用连接或建连失败。
    Unavailable,
    /// 客户端已关闭。
    Shutdown,
    /// 调用方的等待时限先到，调用本身仍在途。
    WaitElapsed,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::Failure => "failure",
            ResultCode::Timeout => "timeout",
            ResultCode::Unavailable => "unavailable",
            ResultCode::Shutdown => "shutdown",
            ResultCode::WaitElapsed => "wait_elapsed",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
