//! # 日志初始化
//!
//! ## 意图（Why）
//! - 客户端内部只通过 `tracing` 宏输出结构化事件，是否以及如何输出由宿主决定；
//! - 对没有自有日志栈的宿主提供一键安装入口：`fmt` 输出加 `RUST_LOG` 过滤（缺省 `info`）。
//!
//! ## 契约（What）
//! - [`install`] 在进程内最多成功一次，重复调用返回 [`TelemetryError::AlreadyInstalled`]；
//! - 若宿主已自行设置全局 Subscriber，返回 [`TelemetryError::SubscriberAlreadySet`]，不做覆盖。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("spark-rpc-client telemetry is already installed")]
    AlreadyInstalled,
    #[error("a global tracing subscriber is already set")]
    SubscriberAlreadySet,
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] dispatcher::SetGlobalDefaultError),
}

/// 安装全局 `tracing` Subscriber。
pub fn install() -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;

    INSTALLED
        .set(())
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
