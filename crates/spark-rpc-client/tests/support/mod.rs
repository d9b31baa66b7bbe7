//! 集成测试共用的内存传输实现。
//!
//! - [`MockConnector`] 记录每次握手，可配置握手延迟与拒绝的地址；
//! - [`MockChannel`] 记录写出的请求，可选择自动回显，也可由测试手动投递响应或模拟断连。

#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use spark_rpc_client::{
    Channel, ConnectOptions, Connector, OutboundRequest, RemoteAddress, RpcError, RpcResult,
    TransportListener,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// 不回复，调用只能由超时或手动投递完成。
    Silent,
    /// 在独立线程上把请求体原样回送。
    Echo,
    /// 在独立线程上回送远端错误。
    Reject,
}

pub struct MockChannel {
    address: RemoteAddress,
    active: AtomicBool,
    reply: Reply,
    listener: Arc<dyn TransportListener>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel")
            .field("address", &self.address)
            .field("active", &self.is_active())
            .finish()
    }
}

impl MockChannel {
    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }

    pub fn respond(&self, id: &str, body: &'static [u8]) {
        self.listener.on_response(id, Bytes::from_static(body));
    }

    /// 模拟远端断开：先置为非活跃，再通知监听方。
    pub fn sever(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.listener.on_disconnected(&self.address);
    }
}

impl Channel for MockChannel {
    fn remote_address(&self) -> &RemoteAddress {
        &self.address
    }

    fn send(&self, request: OutboundRequest) -> RpcResult<()> {
        if !self.is_active() {
            return Err(RpcError::Transport {
                detail: format!("channel to {} is closed", self.address),
            });
        }
        self.sent.lock().push(request.clone());
        let listener = Arc::clone(&self.listener);
        match self.reply {
            Reply::Silent => {}
            Reply::Echo => {
                thread::spawn(move || {
                    listener.on_response(request.correlation_id.as_str(), request.body)
                });
            }
            Reply::Reject => {
                thread::spawn(move || {
                    listener.on_response_error(
                        request.correlation_id.as_str(),
                        RpcError::Remote {
                            code: "biz.rejected".into(),
                            message: format!("{} rejected", request.method),
                        },
                    )
                });
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    delay: Duration,
    reply: Reply,
    refused: Mutex<HashSet<RemoteAddress>>,
    connects: AtomicUsize,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockConnector {
    pub fn new(reply: Reply) -> Arc<Self> {
        Self::with_delay(reply, Duration::ZERO)
    }

    pub fn with_delay(reply: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            reply,
            refused: Mutex::new(HashSet::new()),
            connects: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn refuse(&self, address: &RemoteAddress) {
        self.refused.lock().insert(address.clone());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn channel_to(&self, address: &RemoteAddress) -> Option<Arc<MockChannel>> {
        self.channels
            .lock()
            .iter()
            .rev()
            .find(|channel| &channel.address == address)
            .cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &RemoteAddress,
        _options: &ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> RpcResult<Arc<dyn Channel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.refused.lock().contains(address) {
            return Err(RpcError::Transport {
                detail: "connection refused".into(),
            });
        }
        let channel = Arc::new(MockChannel {
            address: address.clone(),
            active: AtomicBool::new(true),
            reply: self.reply,
            listener,
            sent: Mutex::new(Vec::new()),
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }
}

/// 不关心传输事件的监听方。
pub struct Ignore;

impl TransportListener for Ignore {
    fn on_response(&self, _id: &str, _payload: Bytes) {}

    fn on_response_error(&self, _id: &str, _error: RpcError) {}

    fn on_disconnected(&self, _address: &RemoteAddress) {}
}

pub fn addr(port: u16) -> RemoteAddress {
    RemoteAddress::new("127.0.0.1", port)
}
