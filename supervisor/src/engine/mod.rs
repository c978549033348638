mod command;

pub use command::CommandEngine;

use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use common::units::format_bandwidth;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityMode {
    Normal,
    Throttled,
}

impl fmt::Display for CapacityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityMode::Normal => write!(f, "normal"),
            CapacityMode::Throttled => write!(f, "throttled"),
        }
    }
}

/// Everything an engine instance needs to know about the capacity it may
/// offer. Immutable for the lifetime of the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityConfig {
    pub mode: CapacityMode,
    pub max_common_clients: u32,
    pub max_personal_clients: u32,
    /// Per direction, 0 = unlimited
    pub bandwidth_bytes_per_second: u64,
    pub proxy_key: String,
    pub compartment_id: Option<String>,
    pub emit_activity: bool,
}

impl fmt::Display for CapacityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Max Common Clients: {}, Max Personal Clients: {}, Bandwidth: {})",
            self.mode,
            self.max_common_clients,
            self.max_personal_clients,
            format_bandwidth(self.bandwidth_bytes_per_second)
        )
    }
}

/// Receives raw notice lines from the running engine. Called from the
/// engine's reader task, so implementations must not block for long.
pub trait NoticeSink: Send + Sync {
    fn on_notice(&self, raw: &[u8]);

    /// A new engine instance is about to emit notices.
    fn on_engine_start(&self) {}
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Exactly one sink per engine; a second registration fails.
    fn register_notice_sink(&self, sink: Arc<dyn NoticeSink>) -> Result<()>;

    /// Starts one instance with the given capacity. Errors here are fatal to
    /// the supervisor.
    async fn start(&self, capacity: &CapacityConfig) -> Result<Box<dyn EngineHandle>>;
}

#[async_trait]
pub trait EngineHandle: Send {
    /// Runs until the instance exits on its own or `cancel` fires. On
    /// cancellation the instance is fully stopped before this returns.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()>;
}

#[derive(Default)]
pub(crate) struct SinkSlot {
    sink: Mutex<Option<Arc<dyn NoticeSink>>>,
}

impl SinkSlot {
    pub(crate) fn register(&self, sink: Arc<dyn NoticeSink>) -> Result<()> {
        let mut slot = self.sink.lock();
        if slot.is_some() {
            return Err(SupervisorError::SinkAlreadyRegistered);
        }
        *slot = Some(sink);
        Ok(())
    }

    pub(crate) fn get(&self) -> Result<Arc<dyn NoticeSink>> {
        self.sink
            .lock()
            .clone()
            .ok_or_else(|| SupervisorError::Engine("no notice sink registered".to_string()))
    }
}
