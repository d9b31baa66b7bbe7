//! 挂起调用：完成原语与按关联标识索引的注册表。

mod pending;
mod registry;

pub use pending::{CallState, PendingCall, ResponseCallback};
pub use registry::PendingCallRegistry;
