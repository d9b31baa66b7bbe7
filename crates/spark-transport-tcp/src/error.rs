use std::{io, time::Duration};

use spark_rpc_client::RpcError;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.transport.tcp.resolve_failed",
    message: "tcp resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};

const TIMEOUT_CODE: &str = "spark.transport.tcp.timeout";
const FRAME_TOO_LARGE_CODE: &str = "spark.transport.tcp.frame_too_large";
const MALFORMED_FRAME_CODE: &str = "spark.transport.tcp.malformed_frame";
const CLOSED_CODE: &str = "spark.transport.tcp.closed";
const RUNTIME_CODE: &str = "spark.transport.tcp.runtime_unavailable";

/// TCP 传输层错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 底层 IO 失败，`code` 标识失败的操作。
    #[error("[{code}] {message}")]
    Io {
        code: &'static str,
        message: String,
        retryable: bool,
    },
    #[error("[spark.transport.tcp.timeout] {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("[spark.transport.tcp.frame_too_large] frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("[spark.transport.tcp.malformed_frame] {detail}")]
    MalformedFrame { detail: String },
    #[error("[spark.transport.tcp.closed] channel is closed")]
    Closed,
    #[error("[spark.transport.tcp.runtime_unavailable] {detail}")]
    RuntimeUnavailable { detail: String },
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Io { code, .. } => *code,
            TransportError::Timeout { .. } => TIMEOUT_CODE,
            TransportError::FrameTooLarge { .. } => FRAME_TOO_LARGE_CODE,
            TransportError::MalformedFrame { .. } => MALFORMED_FRAME_CODE,
            TransportError::Closed => CLOSED_CODE,
            TransportError::RuntimeUnavailable { .. } => RUNTIME_CODE,
        }
    }

    /// 是否值得由上层（如健康检查）稍后重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Io { retryable, .. } => *retryable,
            TransportError::Timeout { .. } | TransportError::Closed => true,
            TransportError::FrameTooLarge { .. }
            | TransportError::MalformedFrame { .. }
            | TransportError::RuntimeUnavailable { .. } => false,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::FrameTooLarge { .. } | TransportError::MalformedFrame { .. } => {
                RpcError::Codec {
                    detail: error.to_string(),
                }
            }
            TransportError::RuntimeUnavailable { .. } => RpcError::Runtime {
                detail: error.to_string(),
            },
            other => RpcError::Transport {
                detail: other.to_string(),
            },
        }
    }
}

/// 将 IO 错误映射为传输层错误，并标注是否可重试。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError::Io {
        code: kind.code,
        message: format!("{}: {}", kind.message, error),
        retryable: is_retryable_io(&error),
    }
}

pub(crate) fn timeout_error(kind: OperationKind, after: Duration) -> TransportError {
    TransportError::Timeout {
        operation: kind.message,
        after,
    }
}

fn is_retryable_io(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::WriteZero
    )
}
