//! Notification service.
//!
//! Consumes `user.created` and `order.created` and emails the customer.

use std::sync::Arc;
use storefront_events::{build_transport, BusConfig, ServiceRuntime};
use storefront_notifications::{
    notification_router, ConsoleMailer, Mailer, SmtpConfig, SmtpMailer, DEFAULT_FROM,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "notification-service";
const DEFAULT_PORT: u16 = 8004;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "notification_service=info,storefront_notifications=info,storefront_events=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BusConfig::from_env(SERVICE_NAME, DEFAULT_PORT)?;
    if let Err(e) = config.validate_for_production() {
        warn!(error = %e, "Configuration is not production ready");
    }

    let mailer: Arc<dyn Mailer> = match SmtpConfig::from_env()? {
        Some(smtp) => Arc::new(SmtpMailer::new(&smtp)?),
        None => {
            info!("SMTP_HOST not set; emails are logged instead of sent");
            let from = std::env::var("FROM_EMAIL").unwrap_or_else(|_| DEFAULT_FROM.to_string());
            Arc::new(ConsoleMailer::new(from))
        }
    };
    let router = notification_router(mailer)?;
    let transport = build_transport(&config)?;

    info!(mode = %config.mode, "Starting {SERVICE_NAME}");
    ServiceRuntime::new(config, router, transport).run().await?;
    info!("{SERVICE_NAME} stopped");
    Ok(())
}
