//! HTTP server lifecycle.
//!
//! Binds the listener, serves the [`Gateway`] and owns the background task
//! that keeps dynamic rules current. Everything stops on one watch signal.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use jitreg_core::{GatewayError, Result};
use jitreg_runtime::source::wait_for_shutdown;

use crate::handler::Gateway;

/// Gateway HTTP server configuration.
pub struct GatewayServer {
    /// Address to listen on.
    listen: SocketAddr,
    /// Shared request handler.
    gateway: Arc<Gateway>,
}

/// A started server.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<Result<()>>,
    rules_task: Option<JoinHandle<()>>,
}

impl GatewayServer {
    pub fn new(listen: SocketAddr, gateway: Arc<Gateway>) -> Self {
        Self { listen, gateway }
    }

    /// Bind the listener and start serving.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<RunningServer> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let builder = hyper::Server::try_bind(&self.listen).map_err(|e| {
            GatewayError::ConfigError(format!("Failed to bind {}: {}", self.listen, e))
        })?;

        let gateway = self.gateway.clone();
        let make_svc = make_service_fn(move |_conn| {
            let gateway = gateway.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let gateway = gateway.clone();
                    async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                }))
            }
        });

        let server = builder.serve(make_svc);
        let local_addr = server.local_addr();

        let mut server_shutdown = shutdown_rx.clone();
        let server = server.with_graceful_shutdown(async move {
            wait_for_shutdown(&mut server_shutdown).await;
        });
        let server = tokio::spawn(async move {
            server
                .await
                .map_err(|e| GatewayError::Other(format!("HTTP server failed: {}", e)))
        });

        let rules_task = self.spawn_rules_task(shutdown_rx);

        tracing::info!(addr = %local_addr, "Gateway listening");

        Ok(RunningServer {
            local_addr,
            shutdown_tx,
            server,
            rules_task,
        })
    }

    /// Drive the control-plane source and invalidate the merged rules on
    /// each change it reports.
    fn spawn_rules_task(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let rules = self.gateway.rules().clone();
        let source = rules.source()?.clone();
        // subscribe before the source starts so no change is missed
        let changes = source.subscribe();

        Some(tokio::spawn(async move {
            let (result, ()) = tokio::join!(
                source.run(shutdown.clone()),
                rules.watch(changes, shutdown)
            );
            if let Err(e) = result {
                tracing::error!(error = %e, "Rule source stopped");
            }
        }))
    }
}

impl RunningServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests, finish in-flight ones and stop the
    /// background task.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Run until shutdown is requested through `signal`.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        signal.await;
        tracing::info!("Shutting down gateway");
        self.shutdown().await
    }

    async fn join(self) -> Result<()> {
        if let Some(task) = self.rules_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Rule task ended abnormally");
            }
        }
        self.server
            .await
            .map_err(|e| GatewayError::Other(format!("HTTP server task failed: {}", e)))?
    }
}
