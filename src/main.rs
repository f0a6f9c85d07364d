use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::Context;

use doorman::errors::{ErrorHandler, ErrorRateLimiter};
use doorman::handlers::{self, GuardState};
use doorman::monitoring::Monitoring;
use doorman::session::{SessionStore, SessionValidator, StorageChain};
use doorman::settings::DoormanSettings;
use doorman::timeout::TimeoutManager;
use doorman::verifier::{CredentialSource, HttpVerifier};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = DoormanSettings::load().context("Failed to load settings")?;
    settings.initialize_logging();
    env_logger::init();

    let store = Arc::new(SessionStore::new(
        settings.encryption_key(),
        settings.session_window(),
        settings.budgets().absolute_age,
        settings.cache_ttl(),
    ));

    let primary: Arc<dyn CredentialSource> = Arc::new(
        HttpVerifier::new(
            "primary",
            &settings.verifier.primary_endpoint,
            settings.verifier_timeout(),
        )
        .context("Failed to build primary verifier")?,
    );
    let secondary: Option<Arc<dyn CredentialSource>> = settings
        .verifier
        .secondary_endpoint
        .as_deref()
        .map(|endpoint| {
            HttpVerifier::new("secondary", endpoint, settings.verifier_timeout())
                .context("Failed to build secondary verifier")
        })
        .transpose()?
        .map(|v| Arc::new(v) as Arc<dyn CredentialSource>);

    let validator = Arc::new(SessionValidator::new(
        Arc::clone(&store),
        Arc::new(StorageChain::standard_with_domain(
            settings.application.cookie_secure,
            settings.application.cookie_domain.clone(),
        )),
        primary,
        secondary,
        settings.budgets(),
        settings.refresh_threshold(),
        settings.session.window_secs,
        settings.application.allowed_origins.clone(),
        Vec::new(),
    ));

    let error_handler = Arc::new(ErrorHandler::new(
        Arc::clone(&validator),
        ErrorRateLimiter::new(
            settings.rate_limit.window_secs,
            settings.rate_limit.threshold,
        ),
    ));

    let timeout = Arc::new(TimeoutManager::new(
        Arc::clone(&store),
        settings.budgets(),
        settings.refresh_threshold(),
        settings.poll_interval(),
    ));

    let monitoring = Arc::new(Monitoring::default());
    monitoring.spawn_collectors(store.subscribe(), timeout.subscribe());

    // Background sweeps: dead cache entries and idle rate-limit identities
    let purge_task = store.spawn_purge_task(Duration::from_secs(60));
    let limiter_task = error_handler.spawn_limiter_maintenance(Duration::from_secs(60));

    let state = web::Data::new(GuardState {
        validator,
        error_handler,
        timeout: Arc::clone(&timeout),
        monitoring,
        sign_in_path: settings.application.sign_in_path.clone(),
    });

    let bind_addr = format!("{}:{}", settings.application.host, settings.application.port);
    let allowed_origins = settings.application.allowed_origins.clone();

    log::info!("Starting doorman session guard on {bind_addr}");
    log::info!(
        "Session window {}s, inactivity {}s, absolute age {}s",
        settings.session.window_secs,
        settings.timeout.inactivity_secs,
        settings.timeout.absolute_age_secs
    );

    let server = HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST"])
            .allow_any_header()
            .supports_credentials()
            .max_age(3600);
        for origin in &allowed_origins {
            cors = cors.allowed_origin(origin);
        }

        App::new()
            .app_data(state.clone())
            .wrap(Compress::default())
            .wrap(cors)
            .configure(handlers::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {bind_addr}"))?
    .run()
    .await;

    timeout.shutdown();
    purge_task.abort();
    limiter_task.abort();
    server.context("Server error")
}
