use std::fmt;

use crate::address::RemoteAddress;

/// 服务发现后端产生的地址变更事件。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DiscoveryEvent {
    AddressAdded {
        interface: String,
        address: RemoteAddress,
    },
    AddressRemoved {
        interface: String,
        address: RemoteAddress,
    },
}

impl DiscoveryEvent {
    pub fn added(interface: impl Into<String>, address: RemoteAddress) -> Self {
        DiscoveryEvent::AddressAdded {
            interface: interface.into(),
            address,
        }
    }

    pub fn removed(interface: impl Into<String>, address: RemoteAddress) -> Self {
        DiscoveryEvent::AddressRemoved {
            interface: interface.into(),
            address,
        }
    }

    pub fn interface(&self) -> &str {
        match self {
            DiscoveryEvent::AddressAdded { interface, .. }
            | DiscoveryEvent::AddressRemoved { interface, .. } => interface,
        }
    }

    pub fn address(&self) -> &RemoteAddress {
        match self {
            DiscoveryEvent::AddressAdded { address, .. }
            | DiscoveryEvent::AddressRemoved { address, .. } => address,
        }
    }
}

impl fmt::Display for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::AddressAdded { interface, address } => {
                write!(f, "+{interface}@{address}")
            }
            DiscoveryEvent::AddressRemoved { interface, address } => {
                write!(f, "-{interface}@{address}")
            }
        }
    }
}
