//! Conduit Control Plane Server
//!
//! Runs the dispatcher that processes run change notifications and the
//! reconciler that recovers dead jobs and stuck runs.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conduit_control_plane::{
    config::{AppConfig, DatabaseConfig, LogFormat},
    db::{create_pool, PgStore},
    engine::{JobBookings, MemoryBookings},
    nats::{publisher::stream_name, NatsEventPublisher, NatsJobBookings, NatsRunQueue},
    services::{
        ChannelQueue, DisabledHookService, Dispatcher, EventPublisher, HookService,
        HttpHookService, NoopPublisher, Reconciler, RunQueue,
    },
    state::AppState,
};

/// Initialize tracing/logging.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,conduit_control_plane=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Connect to NATS if configured.
async fn connect_nats(config: &AppConfig) -> Option<async_nats::Client> {
    if let Some(ref nats_url) = config.nats_url {
        match async_nats::connect(nats_url).await {
            Ok(client) => {
                tracing::info!(url = %nats_url, "Connected to NATS");
                Some(client)
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %nats_url, "Failed to connect to NATS, using in-process queue");
                None
            }
        }
    } else {
        tracing::info!("NATS not configured, using in-process queue");
        None
    }
}

/// Run queue, event publisher and job bookings, over NATS when connected.
struct Messaging {
    queue: Arc<dyn RunQueue>,
    events: Arc<dyn EventPublisher>,
    bookings: Arc<dyn JobBookings>,
}

async fn messaging(
    config: &AppConfig,
    client: Option<async_nats::Client>,
) -> anyhow::Result<Messaging> {
    let Some(client) = client else {
        return Ok(Messaging {
            queue: Arc::new(ChannelQueue::new()),
            events: Arc::new(NoopPublisher),
            bookings: Arc::new(MemoryBookings::new(config.booking_ttl())),
        });
    };

    let queue = NatsRunQueue::connect(
        client.clone(),
        &config.run_queue_subject,
        &config.run_queue_stream,
        &config.server_name,
    )
    .await?;
    let events = NatsEventPublisher::new(client.clone(), &config.event_subject_prefix).await?;
    let bookings =
        NatsJobBookings::connect(client, &config.booking_bucket, config.booking_ttl()).await?;

    tracing::info!(
        queue_stream = %config.run_queue_stream,
        event_stream = %stream_name(&config.event_subject_prefix),
        booking_bucket = %config.booking_bucket,
        "JetStream messaging ready"
    );

    Ok(Messaging {
        queue: Arc::new(queue),
        events: Arc::new(events),
        bookings: Arc::new(bookings),
    })
}

fn hook_service(config: &AppConfig) -> Arc<dyn HookService> {
    match config.hook_service_url {
        Some(ref url) => {
            tracing::info!(url = %url, "Outgoing hooks enabled");
            Arc::new(HttpHookService::new(url))
        }
        None => {
            tracing::warn!("CONDUIT_HOOK_SERVICE_URL not set, outgoing hook nodes will fail");
            Arc::new(DisabledHookService)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let app_config = AppConfig::from_env();
    let log_format = app_config
        .as_ref()
        .map(|c| c.log_format)
        .unwrap_or_default();
    init_tracing(log_format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Conduit Control Plane"
    );

    let app_config = app_config.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    tracing::info!(
        server_name = %app_config.server_name,
        database = %db_config.display_url(),
        max_job_retry = app_config.max_job_retry,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    let store = PgStore::new(db_pool);
    store.migrate().await?;

    let nats_client = connect_nats(&app_config).await;
    let messaging = messaging(&app_config, nats_client).await?;
    let hooks = hook_service(&app_config);

    let state = AppState::new(
        Arc::new(store),
        messaging.queue,
        messaging.events,
        hooks,
        app_config,
    )
    .with_bookings(messaging.bookings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(Dispatcher::new(state.clone()).run(shutdown_rx.clone()));
    let reconciler = tokio::spawn(Reconciler::new(state.clone()).run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("dispatcher", dispatcher), ("reconciler", reconciler)] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "Background task panicked");
        }
    }

    tracing::info!(uptime_seconds = state.uptime_seconds(), "Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
