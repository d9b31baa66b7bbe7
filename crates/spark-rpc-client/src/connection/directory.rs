use std::sync::Arc;

use dashmap::DashMap;

use crate::address::RemoteAddress;

/// 接口名到可达地址序列的映射。
///
/// 序列保持发布顺序且无重复；序列被清空时同时移除该接口的键。
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    routes: DashMap<Arc<str>, Vec<RemoteAddress>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布地址；已存在时返回 `false`。
    pub fn publish(&self, interface: &Arc<str>, address: &RemoteAddress) -> bool {
        let mut addresses = self.routes.entry(Arc::clone(interface)).or_default();
        if addresses.contains(address) {
            return false;
        }
        addresses.push(address.clone());
        true
    }

    /// 撤回地址；不存在时返回 `false`。
    pub fn withdraw(&self, interface: &str, address: &RemoteAddress) -> bool {
        let Some(mut addresses) = self.routes.get_mut(interface) else {
            return false;
        };
        let before = addresses.len();
        addresses.retain(|known| known != address);
        let removed = addresses.len() != before;
        drop(addresses);
        if removed {
            self.routes
                .remove_if(interface, |_, addresses| addresses.is_empty());
        }
        removed
    }

    /// 当前地址序列的快照。
    pub fn addresses(&self, interface: &str) -> Vec<RemoteAddress> {
        self.routes
            .get(interface)
            .map(|addresses| addresses.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, interface: &str, address: &RemoteAddress) -> bool {
        self.routes
            .get(interface)
            .is_some_and(|addresses| addresses.contains(address))
    }

    pub fn interface_count(&self) -> usize {
        self.routes.len()
    }

    pub fn clear(&self) {
        self.routes.clear();
    }
}
