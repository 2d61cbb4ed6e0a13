use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use radio_relay::api::{ApiServer, AppState, JwtService};
use radio_relay::collaborators::{Collaborators, TracingAudit, WebhookNotifier};
use radio_relay::config::AppConfig;
use radio_relay::logging;
use radio_relay::scheduler::{DEFAULT_SCHEDULER_WORKERS, Scheduler};
use radio_relay::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default();
    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("Failed to initialize logging")?;
    config.validate().context("Invalid configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting radio-relay");

    let mut collaborators = Collaborators::noop().with_audit(Arc::new(TracingAudit));
    if let Some(webhook) = config.webhook.clone() {
        info!("Webhook notifications enabled");
        collaborators = collaborators.with_notifier(Arc::new(WebhookNotifier::new(webhook)));
    }

    let scheduler = Scheduler::dedicated(DEFAULT_SCHEDULER_WORKERS)
        .context("Failed to start scheduler runtime")?;
    let services = Arc::new(
        ServiceContainer::from_config(&config, collaborators, scheduler)
            .context("Failed to build relay core")?,
    );

    match config.transcoder.detect_version() {
        Some(version) => info!(%version, "Transcoder detected"),
        None => {
            warn!(
                path = %config.transcoder.ffmpeg_path,
                "Transcoder not found; broadcasts will be rejected until it is available"
            );
            services.relays.set_transcoder_available(false);
        }
    }

    services.initialize();
    logging_config.start_retention_cleanup(services.cancellation_token());

    let mut state = AppState::new(services.clone()).with_logging_config(logging_config);
    match &config.jwt {
        Some(jwt) => state = state.with_jwt_service(Arc::new(JwtService::new(jwt))),
        None => info!("JWT_SECRET not set; every listener is anonymous"),
    }

    let server = ApiServer::new(config.server.clone(), state);
    let shutdown = server.cancel_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Ctrl-C received, shutting down");
        shutdown.cancel();
    });

    let served = server.run().await;
    services.shutdown().await;
    served.context("API server failed")?;

    info!("radio-relay stopped");
    Ok(())
}
