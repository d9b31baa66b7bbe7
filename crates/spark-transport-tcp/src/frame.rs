//! # 帧格式
//!
//! 所有整数均为大端序：
//!
//! ```text
//! +-----------+--------+---------------------------+
//! | len: u32  | kind:u8| fields ...                |
//! +-----------+--------+---------------------------+
//! ```
//!
//! - `len` 为其后（`kind` 起）的字节数，超过 `max_frame_len` 的帧直接拒绝；
//! - `kind = 0` 请求：`id`、`interface`、`method` 三个字符串后接请求体；
//! - `kind = 1` 响应：`id` 后接响应体；
//! - `kind = 2` 错误：`id`、`code`、`message` 三个字符串；
//! - 字符串编码为 `u16` 长度前缀加 UTF-8 字节。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spark_rpc_client::OutboundRequest;

use crate::error::TransportError;

/// 长度前缀字节数。
pub const LENGTH_PREFIX_LEN: usize = 4;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;
const KIND_ERROR: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Request {
        correlation_id: String,
        interface: String,
        method: String,
        body: Bytes,
    },
    Response {
        correlation_id: String,
        body: Bytes,
    },
    Error {
        correlation_id: String,
        code: String,
        message: String,
    },
}

impl Frame {
    pub fn correlation_id(&self) -> &str {
        match self {
            Frame::Request { correlation_id, .. }
            | Frame::Response { correlation_id, .. }
            | Frame::Error { correlation_id, .. } => correlation_id,
        }
    }

    /// 追加编码到 `dst`；超过 `max_frame_len` 时回滚已写入的字节并返回错误。
    pub fn encode(&self, max_frame_len: usize, dst: &mut BytesMut) -> Result<(), TransportError> {
        let start = dst.len();
        dst.put_u32(0);
        let written = self.encode_fields(dst);
        let len = dst.len() - start - LENGTH_PREFIX_LEN;
        if let Err(err) = written {
            dst.truncate(start);
            return Err(err);
        }
        if len > max_frame_len || u32::try_from(len).is_err() {
            dst.truncate(start);
            return Err(TransportError::FrameTooLarge {
                len,
                max: max_frame_len,
            });
        }
        dst[start..start + LENGTH_PREFIX_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }

    fn encode_fields(&self, dst: &mut BytesMut) -> Result<(), TransportError> {
        match self {
            Frame::Request {
                correlation_id,
                interface,
                method,
                body,
            } => {
                dst.put_u8(KIND_REQUEST);
                put_str(dst, correlation_id)?;
                put_str(dst, interface)?;
                put_str(dst, method)?;
                dst.extend_from_slice(body);
            }
            Frame::Response {
                correlation_id,
                body,
            } => {
                dst.put_u8(KIND_RESPONSE);
                put_str(dst, correlation_id)?;
                dst.extend_from_slice(body);
            }
            Frame::Error {
                correlation_id,
                code,
                message,
            } => {
                dst.put_u8(KIND_ERROR);
                put_str(dst, correlation_id)?;
                put_str(dst, code)?;
                put_str(dst, message)?;
            }
        }
        Ok(())
    }
}

impl From<OutboundRequest> for Frame {
    fn from(request: OutboundRequest) -> Self {
        Frame::Request {
            correlation_id: request.correlation_id.to_string(),
            interface: request.interface,
            method: request.method,
            body: request.body,
        }
    }
}

/// 增量帧解码器：缓冲区不足一帧时返回 `Ok(None)`，等待更多字节。
#[derive(Clone, Copy, Debug)]
pub struct FrameDecoder {
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if len == 0 {
            return Err(malformed("empty frame"));
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let mut payload = src.split_to(len).freeze();
        let frame = match payload.get_u8() {
            KIND_REQUEST => Frame::Request {
                correlation_id: take_str(&mut payload)?,
                interface: take_str(&mut payload)?,
                method: take_str(&mut payload)?,
                body: payload,
            },
            KIND_RESPONSE => Frame::Response {
                correlation_id: take_str(&mut payload)?,
                body: payload,
            },
            KIND_ERROR => Frame::Error {
                correlation_id: take_str(&mut payload)?,
                code: take_str(&mut payload)?,
                message: take_str(&mut payload)?,
            },
            other => return Err(malformed(format!("unknown frame kind {other}"))),
        };
        Ok(Some(frame))
    }
}

fn put_str(dst: &mut BytesMut, value: &str) -> Result<(), TransportError> {
    let len = u16::try_from(value.len())
        .map_err(|_| malformed(format!("string field of {} bytes is too long", value.len())))?;
    dst.put_u16(len);
    dst.extend_from_slice(value.as_bytes());
    Ok(())
}

fn take_str(src: &mut Bytes) -> Result<String, TransportError> {
    if src.remaining() < 2 {
        return Err(malformed("truncated string length"));
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(malformed("truncated string field"));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|err| malformed(format!("invalid utf-8: {err}")))
}

fn malformed(detail: impl Into<String>) -> TransportError {
    TransportError::MalformedFrame {
        detail: detail.into(),
    }
}
