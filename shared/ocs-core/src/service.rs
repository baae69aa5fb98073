//! Service lifecycle
//!
//! Charging services carry in-flight state that must not be dropped on
//! exit: rated CDRs sit in memory buffers and the last guarded sections may
//! still be persisting accounts. The runtime races the serving future
//! against the shutdown signal, then gives the service a bounded drain
//! window to flush before the process ends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

use crate::error::Result;

/// Lifecycle phase reported by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Serving,
    Draining,
}

/// Combined liveness/readiness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    pub detail: Option<String>,
}

/// Implemented by every charging service binary.
#[async_trait]
pub trait OcsService: Send + Sync + 'static {
    /// Service identifier (e.g., "charging-engine")
    fn service_id(&self) -> &'static str;

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Probe report for the orchestrator.
    async fn status(&self) -> ServiceStatus;

    /// Bind and serve until failure.
    async fn serve(&self) -> Result<()>;

    /// Flush buffers and finish in-flight persists. Called exactly once,
    /// after serving stops and before the process exits.
    async fn drain(&self) -> Result<()>;
}

/// Runs a service until SIGINT/SIGTERM, then drains it within a bounded
/// window so buffered CDRs and pending account writes are not lost.
pub struct ServiceRuntime {
    drain_window: Duration,
}

impl ServiceRuntime {
    pub fn new() -> Self {
        Self {
            drain_window: Duration::from_secs(10),
        }
    }

    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    pub async fn run<S: OcsService>(&self, service: Arc<S>) -> Result<()> {
        let started = Instant::now();
        info!(
            service_id = service.service_id(),
            version = service.version(),
            "Charging service starting"
        );

        let server = service.clone();
        tokio::select! {
            result = server.serve() => match result {
                Ok(()) => info!("Server loop completed"),
                Err(e) => error!(error = %e, "Server loop failed"),
            },
            _ = shutdown_signal() => {
                info!("Shutdown requested, draining in-flight work");
            }
        }

        match tokio::time::timeout(self.drain_window, service.drain()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Drain reported an error"),
            Err(_) => warn!(
                window_seconds = self.drain_window.as_secs(),
                "Drain window expired before the service finished flushing"
            ),
        }

        info!(
            service_id = service.service_id(),
            uptime_seconds = started.elapsed().as_secs(),
            "Charging service stopped"
        );
        Ok(())
    }
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on SIGINT, and on SIGTERM where the platform has one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
