//! # ConnectionSupervisor：连接表、服务目录与就绪闸门
//!
//! ## 角色定位（Why）
//! - 每个远端地址至多维持一条连接，多个接口可以共享同一地址的连接；
//! - 服务目录只收录拥有活跃连接的地址，选址永远在“可达集合”内进行；
//! - 新接口在拿到第一个地址之前，选路调用方在该接口自己的闸门上等待，互不牵连。
//!
//! ## 并发契约（What）
//! - 建连采用 `DashMap::entry` 原子“若无则占位”：同一地址的并发建连收敛为一次握手，
//!   其余调用方把接口挂到在途尝试上即返回；
//! - 每次尝试携带递增的尝试号，握手完成时只有尝试号仍匹配的 `Connecting` 条目会被置为 `Active`，
//!   期间被摘除或重启的尝试得到 [`ConnectOutcome::Withdrawn`]，新建的通道随即关闭；
//! - 锁顺序固定为“连接表 → 服务目录 → 闸门表”，目录发布与撤回都在连接表条目锁内完成，
//!   目录因此不会引用没有活跃条目的地址。
//!
//! ## 风险提示（Trade-offs）
//! - 握手期间不持有任何锁；握手失败只返回给发起方，挂在同一尝试上的其他调用方不会收到通知。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    address::RemoteAddress,
    config::ConnectOptions,
    connection::{directory::ServiceDirectory, gate::ReadinessGate},
    error::{RpcError, RpcResult},
    selector::AddressSelector,
    transport::{Channel, Connector, TransportListener},
};

/// 连接条目状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Active,
    /// 曾经建立、随后断开；可通过 `reconnect` 重新建立。
    Closed,
}

/// `add_connection` / `reconnect` 的成功结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectOutcome {
    /// 本次调用完成了握手。
    Established,
    /// 地址已有活跃连接，接口已挂接。
    AlreadyActive,
    /// 同一地址已有在途尝试，接口已挂接到该尝试。
    InFlight,
    /// 握手期间条目被摘除或被新尝试取代，新通道已关闭。
    Withdrawn,
}

struct ConnectionEntry {
    status: ConnectionStatus,
    channel: Option<Arc<dyn Channel>>,
    interfaces: Vec<Arc<str>>,
    attempt: u64,
    established: bool,
}

impl ConnectionEntry {
    fn connecting(interface: Arc<str>, attempt: u64) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            channel: None,
            interfaces: vec![interface],
            attempt,
            established: false,
        }
    }

    fn attach(&mut self, interface: &Arc<str>) {
        if !self.interfaces.contains(interface) {
            self.interfaces.push(Arc::clone(interface));
        }
    }

    fn begin_attempt(&mut self, attempt: u64) -> Option<Arc<dyn Channel>> {
        self.status = ConnectionStatus::Connecting;
        self.attempt = attempt;
        self.channel.take()
    }
}

/// 连接监管器。
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    selector: Arc<dyn AddressSelector>,
    options: ConnectOptions,
    listener: Arc<dyn TransportListener>,
    connections: DashMap<RemoteAddress, ConnectionEntry>,
    directory: ServiceDirectory,
    gates: DashMap<Arc<str>, Arc<ReadinessGate>>,
    attempts: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        selector: Arc<dyn AddressSelector>,
        options: ConnectOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Self {
        Self {
            connector,
            selector,
            options,
            listener,
            connections: DashMap::new(),
            directory: ServiceDirectory::new(),
            gates: DashMap::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// 为 `interface` 建立（或复用）到 `address` 的连接。
    ///
    /// # 契约
    /// - 地址已活跃：挂接接口、发布到该接口目录并打开其闸门，返回 [`ConnectOutcome::AlreadyActive`]；
    /// - 地址在建连中：挂接接口，返回 [`ConnectOutcome::InFlight`]，握手成功时一并发布；
    /// - 否则占位并握手，成功后对所有挂接接口发布地址、打开闸门。
    ///
    /// # 错误
    /// - 握手失败返回 [`RpcError::ConnectionFailed`]，目录与闸门保持不变。
    pub async fn add_connection(
        &self,
        interface: &str,
        address: &RemoteAddress,
    ) -> RpcResult<ConnectOutcome> {
        let interface: Arc<str> = Arc::from(interface);
        let (attempt, previous) = match self.connections.entry(address.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.attach(&interface);
                match entry.status {
                    ConnectionStatus::Active => {
                        if self.directory.publish(&interface, address) {
                            tracing::info!(address = %address, interface = %interface, "interface attached to active connection");
                        }
                        self.gate(&interface).open();
                        return Ok(ConnectOutcome::AlreadyActive);
                    }
                    ConnectionStatus::Connecting => {
                        tracing::debug!(address = %address, interface = %interface, "joined in-flight connection attempt");
                        return Ok(ConnectOutcome::InFlight);
                    }
                    ConnectionStatus::Closed => {
                        let attempt = self.next_attempt();
                        (attempt, entry.begin_attempt(attempt))
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let attempt = self.next_attempt();
                vacant.insert(ConnectionEntry::connecting(interface, attempt));
                (attempt, None)
            }
        };
        if let Some(channel) = previous {
            channel.close();
        }
        self.establish(address, attempt).await
    }

    /// 让 `interface` 放弃 `address`。
    ///
    /// 地址从该接口目录撤回；没有任何接口继续使用时优雅关闭通道并删除条目。
    /// 返回接口此前是否挂接在该地址上。
    pub fn remove_connection(&self, interface: &str, address: &RemoteAddress) -> bool {
        let (detached, channel) = {
            let Some(mut entry) = self.connections.get_mut(address) else {
                return false;
            };
            let before = entry.interfaces.len();
            entry.interfaces.retain(|known| &**known != interface);
            let detached = entry.interfaces.len() != before;
            self.directory.withdraw(interface, address);
            if !entry.interfaces.is_empty() {
                tracing::info!(address = %address, interface = %interface, "interface detached, connection still shared");
                return detached;
            }
            drop(entry);
            let channel = self
                .connections
                .remove_if(address, |_, entry| entry.interfaces.is_empty())
                .and_then(|(_, entry)| entry.channel);
            (detached, channel)
        };
        if let Some(channel) = channel {
            channel.close();
        }
        tracing::info!(address = %address, interface = %interface, "connection removed");
        detached
    }

    /// 对已知地址重新建连。
    ///
    /// 尝试期间地址从所有目录撤回，旧通道被关闭；成功与失败的处理与 `add_connection` 相同，
    /// 但失败不会删除条目，条目保持 `Closed` 以便再次重连。
    ///
    /// # 错误
    /// - 地址不在连接表中：[`RpcError::UnknownAddress`]。
    pub async fn reconnect(&self, address: &RemoteAddress) -> RpcResult<ConnectOutcome> {
        let (attempt, previous) = {
            let Some(mut entry) = self.connections.get_mut(address) else {
                return Err(RpcError::UnknownAddress {
                    address: address.clone(),
                });
            };
            if entry.status == ConnectionStatus::Connecting {
                return Ok(ConnectOutcome::InFlight);
            }
            for interface in &entry.interfaces {
                self.directory.withdraw(interface, address);
            }
            let attempt = self.next_attempt();
            (attempt, entry.begin_attempt(attempt))
        };
        if let Some(channel) = previous {
            channel.close();
        }
        tracing::info!(address = %address, "reconnecting");
        self.establish(address, attempt).await
    }

    /// 传输层断连通知：撤回地址并把条目标记为 `Closed`。
    ///
    /// 当前通道仍然活跃时视为过期通知并忽略，返回是否发生了状态迁移。
    pub fn on_disconnected(&self, address: &RemoteAddress) -> bool {
        let channel = {
            let Some(mut entry) = self.connections.get_mut(address) else {
                return false;
            };
            if entry.status != ConnectionStatus::Active {
                return false;
            }
            if entry.channel.as_ref().is_some_and(|channel| channel.is_active()) {
                tracing::debug!(address = %address, "stale disconnect notification ignored");
                return false;
            }
            for interface in &entry.interfaces {
                self.directory.withdraw(interface, address);
            }
            entry.status = ConnectionStatus::Closed;
            entry.channel.take()
        };
        if let Some(channel) = channel {
            channel.close();
        }
        tracing::warn!(address = %address, "connection lost");
        true
    }

    /// 为 `interface` 选出一个活跃通道，必要时阻塞等待其闸门打开。
    pub fn select_channel(&self, interface: &str) -> RpcResult<Arc<dyn Channel>> {
        self.gate(interface).wait();
        self.pick(interface, None)
    }

    /// 有界等待版本。
    ///
    /// # 错误
    /// - `max_wait` 内闸门未打开：[`RpcError::ReadinessTimeout`]。
    pub fn select_channel_within(
        &self,
        interface: &str,
        max_wait: Duration,
    ) -> RpcResult<Arc<dyn Channel>> {
        if !self.gate(interface).wait_for(max_wait) {
            return Err(RpcError::ReadinessTimeout {
                interface: interface.to_owned(),
                waited: max_wait,
            });
        }
        self.pick(interface, None)
    }

    /// 异步版本，等待闸门期间不占用线程。
    pub async fn select_channel_async(&self, interface: &str) -> RpcResult<Arc<dyn Channel>> {
        self.gate(interface).opened().await;
        self.pick(interface, None)
    }

    /// 不等待闸门，直接按策略在当前可达集合中选址。
    ///
    /// # 错误
    /// - 集合为空，或选中的地址在选址与查表之间失去活跃连接：[`RpcError::NoReachableAddress`]。
    pub fn pick(&self, interface: &str, key: Option<&[u8]>) -> RpcResult<Arc<dyn Channel>> {
        let unreachable = || RpcError::NoReachableAddress {
            interface: interface.to_owned(),
        };
        let addresses = self.directory.addresses(interface);
        let address = self
            .selector
            .select(&addresses, key)
            .ok_or_else(unreachable)?;
        let entry = self.connections.get(address).ok_or_else(unreachable)?;
        match (entry.status, &entry.channel) {
            (ConnectionStatus::Active, Some(channel)) => {
                tracing::trace!(interface, address = %address, selector = self.selector.name(), "channel selected");
                Ok(Arc::clone(channel))
            }
            _ => Err(unreachable()),
        }
    }

    pub fn status(&self, address: &RemoteAddress) -> Option<ConnectionStatus> {
        self.connections.get(address).map(|entry| entry.status)
    }

    /// 接口当前可达地址的快照。
    pub fn addresses(&self, interface: &str) -> Vec<RemoteAddress> {
        self.directory.addresses(interface)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_ready(&self, interface: &str) -> bool {
        self.gates.get(interface).is_some_and(|gate| gate.is_open())
    }

    /// 关闭全部通道、清空连接表与目录，并打开所有闸门释放等待方。
    ///
    /// 返回被关闭的通道数量。
    pub fn close_all(&self) -> usize {
        let addresses: Vec<RemoteAddress> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut closed = 0;
        for address in addresses {
            if let Some((_, entry)) = self.connections.remove(&address)
                && let Some(channel) = entry.channel
            {
                channel.close();
                closed += 1;
            }
        }
        self.directory.clear();
        for gate in self.gates.iter() {
            gate.open();
        }
        tracing::info!(closed, "all connections closed");
        closed
    }

    pub(crate) fn gate(&self, interface: &str) -> Arc<ReadinessGate> {
        if let Some(gate) = self.gates.get(interface) {
            return Arc::clone(gate.value());
        }
        let gate = self
            .gates
            .entry(Arc::from(interface))
            .or_insert_with(|| Arc::new(ReadinessGate::new()));
        Arc::clone(gate.value())
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn establish(&self, address: &RemoteAddress, attempt: u64) -> RpcResult<ConnectOutcome> {
        tracing::debug!(address = %address, attempt, "connecting");
        let result = self
            .connector
            .connect(address, &self.options, Arc::clone(&self.listener))
            .await;

        let mut orphan = None;
        let outcome = match self.connections.get_mut(address) {
            Some(mut entry)
                if entry.status == ConnectionStatus::Connecting && entry.attempt == attempt =>
            {
                match result {
                    Ok(channel) => {
                        entry.status = ConnectionStatus::Active;
                        entry.channel = Some(channel);
                        entry.established = true;
                        for interface in &entry.interfaces {
                            self.directory.publish(interface, address);
                            self.gate(interface).open();
                        }
                        tracing::info!(address = %address, interfaces = entry.interfaces.len(), "connection established");
                        Ok(ConnectOutcome::Established)
                    }
                    Err(err) => {
                        let error = connection_failed(address, err);
                        if entry.established {
                            entry.status = ConnectionStatus::Closed;
                        } else {
                            drop(entry);
                            self.connections.remove_if(address, |_, entry| {
                                entry.attempt == attempt
                                    && entry.status == ConnectionStatus::Connecting
                            });
                        }
                        tracing::warn!(address = %address, code = error.code(), error = %error, "connection attempt failed");
                        Err(error)
                    }
                }
            }
            _ => {
                orphan = result.ok();
                Ok(ConnectOutcome::Withdrawn)
            }
        };
        if let Some(channel) = orphan {
            channel.close();
            tracing::info!(address = %address, attempt, "connection withdrawn during handshake");
        }
        outcome
    }
}

fn connection_failed(address: &RemoteAddress, error: RpcError) -> RpcError {
    match error {
        RpcError::ConnectionFailed { .. } => error,
        other => RpcError::ConnectionFailed {
            address: address.clone(),
            detail: other.to_string(),
        },
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("connections", &self.connections.len())
            .field("interfaces", &self.directory.interface_count())
            .field("selector", &self.selector.name())
            .finish()
    }
}
