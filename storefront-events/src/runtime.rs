//! Service process wiring.
//!
//! Picks the transport named by configuration, connects it, and keeps the
//! process serving until shutdown: the dispatch loop in log mode, the
//! webhook endpoints in relay mode. Business code only ever sees the
//! `Arc<dyn Transport>` and the [`TopicRouter`].

use crate::bus::{Transport, TransportError, TransportMode, TransportResult};
use crate::config::BusConfig;
use crate::relay::RelayTransport;
use crate::router::TopicRouter;
use crate::webhook::{webhook_router, WebhookState};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Build the transport selected by `config.mode`.
///
/// Log mode needs the `kafka` feature; without it this fails with
/// [`TransportError::ConfigurationError`].
pub fn build_transport(config: &BusConfig) -> TransportResult<Arc<dyn Transport>> {
    match config.mode {
        TransportMode::Relay => Ok(Arc::new(RelayTransport::new(config.relay.clone())?)),
        TransportMode::Log => build_log_transport(config),
    }
}

#[cfg(feature = "kafka")]
fn build_log_transport(config: &BusConfig) -> TransportResult<Arc<dyn Transport>> {
    use crate::log::{KafkaLog, LogTransport};

    let client = KafkaLog::new(&config.log)?;
    Ok(Arc::new(LogTransport::new(client, config.log.clone())))
}

#[cfg(not(feature = "kafka"))]
fn build_log_transport(_config: &BusConfig) -> TransportResult<Arc<dyn Transport>> {
    Err(TransportError::ConfigurationError(
        "log mode requires building with the `kafka` feature".to_string(),
    ))
}

/// Wait for Ctrl-C.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Unable to listen for shutdown signal"),
    }
}

/// One service process: a transport, its routes, and the serving loop.
pub struct ServiceRuntime {
    config: BusConfig,
    router: Arc<TopicRouter>,
    transport: Arc<dyn Transport>,
}

impl ServiceRuntime {
    /// Assemble a runtime around an already built transport.
    pub fn new(config: BusConfig, router: TopicRouter, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            router: Arc::new(router),
            transport,
        }
    }

    /// Transport handle, for producers living in the same process.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> TransportResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` completes, then disconnect.
    ///
    /// A connection failure is returned before anything is served.
    pub async fn run_until<F>(self, shutdown: F) -> TransportResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mode = self.transport.mode();
        tracing::info!(
            service = %self.config.service_name,
            mode = %mode,
            topics = ?self.router.topics(),
            "Starting service runtime"
        );

        self.transport.connect().await?;
        self.transport.subscribe(self.router.clone()).await?;

        let served = match mode {
            TransportMode::Log => {
                shutdown.await;
                Ok(())
            }
            TransportMode::Relay => self.serve_webhooks(shutdown).await,
        };

        let disconnected = self.transport.disconnect().await;
        tracing::info!(service = %self.config.service_name, stats = ?self.transport.stats(), "Service stopped");
        served.and(disconnected)
    }

    async fn serve_webhooks<F>(&self, shutdown: F) -> TransportResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let webhook = &self.config.webhook;
        let state = WebhookState::new(
            self.config.service_name.clone(),
            self.router.clone(),
            webhook.verifier(),
            webhook.handler_timeout,
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], webhook.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionError {
                mode: TransportMode::Relay,
                reason: format!("failed to bind {addr}: {e}"),
            })?;

        tracing::info!(%addr, "Webhook endpoints listening");

        axum::serve(listener, webhook_router(state))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| TransportError::ConnectionError {
                mode: TransportMode::Relay,
                reason: format!("webhook server failed: {e}"),
            })
    }
}
