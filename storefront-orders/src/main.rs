//! Order service.
//!
//! Consumes `payment.successful` and publishes `order.created`.

use std::sync::Arc;
use storefront_events::{build_transport, BusConfig, ServiceRuntime, Topic, TopicRouter};
use storefront_orders::{MemoryOrderStore, OrderCreationHandler, OrderCreationWorkflow};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "order-service";
const DEFAULT_PORT: u16 = 8001;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "order_service=info,storefront_events=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BusConfig::from_env(SERVICE_NAME, DEFAULT_PORT)?;
    if let Err(e) = config.validate_for_production() {
        warn!(error = %e, "Configuration is not production ready");
    }

    let transport = build_transport(&config)?;
    let workflow = OrderCreationWorkflow::new(Arc::new(MemoryOrderStore::new()))
        .with_publisher(transport.clone());

    let router = TopicRouter::builder()
        .route(
            Topic::PaymentSuccessful,
            Arc::new(OrderCreationHandler::new(Arc::new(workflow))),
        )
        .build()?;

    info!(mode = %config.mode, "Starting {SERVICE_NAME}");
    ServiceRuntime::new(config, router, transport).run().await?;
    info!("{SERVICE_NAME} stopped");
    Ok(())
}
