//! 消息体编解码契约与结构化响应。
//!
//! - 每种消息类型通过实现 [`Encode`] / [`Decode`] 显式声明序列化能力，编译期确定，
//!   客户端不做任何运行时反射查找；
//! - [`RpcResponse`] 是调用方最终拿到的唯一形态：成功时携带响应体，失败/超时时为
//!   只含结果码与说明文字的哨兵响应。

use bytes::{Bytes, BytesMut};

use crate::{
    error::{ResultCode, RpcError, RpcResult},
    id::CorrelationId,
};

/// 将消息体写入缓冲区的能力。
pub trait Encode {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()>;

    /// 便捷方法：编码为独立的 `Bytes`。
    fn to_bytes(&self) -> RpcResult<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// 从字节切片解码消息体的能力。
pub trait Decode: Sized {
    fn decode(src: &[u8]) -> RpcResult<Self>;
}

impl Encode for Bytes {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        dst.extend_from_slice(self);
        Ok(())
    }

    fn to_bytes(&self) -> RpcResult<Bytes> {
        Ok(self.clone())
    }
}

impl Decode for Bytes {
    fn decode(src: &[u8]) -> RpcResult<Self> {
        Ok(Bytes::copy_from_slice(src))
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        dst.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    fn decode(src: &[u8]) -> RpcResult<Self> {
        Ok(src.to_vec())
    }
}

impl Encode for String {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        dst.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Encode for str {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        dst.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Decode for String {
    fn decode(src: &[u8]) -> RpcResult<Self> {
        String::from_utf8(src.to_vec()).map_err(|err| RpcError::Codec {
            detail: format!("response body is not utf-8: {err}"),
        })
    }
}

/// 以 JSON 编码的消息体适配器。
#[cfg(feature = "json")]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Json<T>(pub T);

#[cfg(feature = "json")]
impl<T: serde::Serialize> Encode for Json<T> {
    fn encode(&self, dst: &mut BytesMut) -> RpcResult<()> {
        let body = serde_json::to_vec(&self.0).map_err(|err| RpcError::Codec {
            detail: err.to_string(),
        })?;
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(feature = "json")]
impl<T: serde::de::DeserializeOwned> Decode for Json<T> {
    fn decode(src: &[u8]) -> RpcResult<Self> {
        serde_json::from_slice(src)
            .map(Json)
            .map_err(|err| RpcError::Codec {
                detail: err.to_string(),
            })
    }
}

/// 交给传输层写出的一次请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
    pub correlation_id: CorrelationId,
    pub interface: String,
    pub method: String,
    pub body: Bytes,
}

/// 调用方拿到的结构化响应。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcResponse {
    correlation_id: CorrelationId,
    code: ResultCode,
    message: Option<String>,
    body: Bytes,
    error: Option<RpcError>,
}

impl RpcResponse {
    /// 远端成功返回的响应。
    pub fn success(correlation_id: CorrelationId, body: Bytes) -> Self {
        Self {
            correlation_id,
            code: ResultCode::Success,
            message: None,
            body,
            error: None,
        }
    }

    /// 根据错误合成哨兵响应。
    pub fn sentinel(correlation_id: CorrelationId, error: &RpcError) -> Self {
        Self {
            error: Some(error.clone()),
            ..Self::with_code(correlation_id, error.result_code(), error.to_string())
        }
    }

    pub(crate) fn with_code(
        correlation_id: CorrelationId,
        code: ResultCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            code,
            message: Some(message.into()),
            body: Bytes::new(),
            error: None,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// 失败说明；成功响应为 `None`。
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// 合成该哨兵响应的原始错误。
    pub fn error(&self) -> Option<&RpcError> {
        self.error.as_ref()
    }

    /// 将成功响应体解码为具体消息。
    ///
    /// 哨兵响应返回合成它的原始错误，超时仍是 [`RpcError::CallTimedOut`]，
    /// 关闭仍是 [`RpcError::Shutdown`]；没有原始错误的失败响应按结果码与说明组装。
    pub fn decode<M: Decode>(&self) -> RpcResult<M> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if !self.is_success() {
            return Err(RpcError::Remote {
                code: self.code.as_str().to_owned(),
                message: self.message.clone().unwrap_or_default(),
            });
        }
        M::decode(&self.body)
    }
}
