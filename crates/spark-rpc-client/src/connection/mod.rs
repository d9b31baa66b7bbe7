//! 连接监管：连接表、按接口分组的服务目录与就绪闸门。

mod directory;
mod gate;
mod supervisor;

pub use directory::ServiceDirectory;
pub use gate::{GateOpened, ReadinessGate};
pub use supervisor::{ConnectOutcome, ConnectionStatus, ConnectionSupervisor};
