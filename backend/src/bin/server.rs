use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nodewatch::alerting::expiry_watcher::ExpiryWatcher;
use nodewatch::alerting::traffic_monitor::TrafficMonitor;
use nodewatch::db;
use nodewatch::db::services::record_service::TierWindows;
use nodewatch::db::tasks::RecordMaintenance;
use nodewatch::legacy::service::LegacyAgentService;
use nodewatch::legacy_proto::nezha_service_server::NezhaServiceServer;
use nodewatch::notifications::senders::webhook::WebhookSender;
use nodewatch::notifications::senders::SenderRegistry;
use nodewatch::notifications::service::{event_channel, NotificationDispatcher, EVENT_QUEUE_CAPACITY};
use nodewatch::server::config::ServerConfig;
use nodewatch::server::metric_buffer::MinuteAggregator;
use nodewatch::server::supervisor::spawn_supervised;
use nodewatch::version::VERSION;
use nodewatch::web::{create_axum_router, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // File: JSON, rotated daily
    let file_appender = rolling::daily(log_dir, "server.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Plain output for packaging scripts.
    if std::env::args().any(|arg| arg == "--version") {
        println!("Server version: {VERSION}");
        return Ok(());
    }

    let args = Args::parse();

    let config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir);
    info!(version = VERSION, "Starting nodewatch server.");

    let db = db::connect(&config.database_url).await?;
    info!("Database ready.");

    let (events, events_rx) = event_channel(EVENT_QUEUE_CAPACITY);
    let app_state = AppState::new(db.clone(), config.clone(), events.clone())?;
    let context = app_state.agent_context.clone();

    if let Err(e) = context.presence.reload_rules(&db).await {
        error!(error = %e, "Failed to load offline rules.");
    }
    if let Err(e) = app_state.ping_scheduler.reload_from_db(&db).await {
        error!(error = %e, "Failed to load ping tasks.");
    }
    if let Err(e) = app_state.load_scheduler.reload_from_db(&db).await {
        error!(error = %e, "Failed to load load rules.");
    }

    // --- Background workers ---
    let aggregator = Arc::new(MinuteAggregator::new(context.buffer.clone(), db.clone()));
    spawn_supervised("minute_aggregator", move || {
        let aggregator = aggregator.clone();
        async move { aggregator.run().await }
    });

    let maintenance = Arc::new(RecordMaintenance::new(
        db.clone(),
        TierWindows {
            short_term: config.short_term_window(),
            bucket: config.compaction_bucket(),
        },
        app_state.subscribe_settings(),
    ));
    let maintenance_interval = Duration::from_secs(config.maintenance_interval_seconds);
    spawn_supervised("record_maintenance", move || {
        let maintenance = maintenance.clone();
        async move { maintenance.run_periodic_tasks(maintenance_interval).await }
    });

    let mut senders = SenderRegistry::with_defaults();
    if let Some(webhook) = config.webhook.clone() {
        match WebhookSender::new(webhook) {
            Ok(sender) => senders.register(Arc::new(sender)),
            Err(e) => warn!(error = %e, "Webhook sender disabled."),
        }
    }
    info!(senders = ?senders.names(), "Notification senders registered.");
    let dispatcher = Arc::new(NotificationDispatcher::new(
        db.clone(),
        senders,
        app_state.subscribe_settings(),
        events_rx,
    ));
    spawn_supervised("notification_dispatcher", move || {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });

    let expiry = Arc::new(ExpiryWatcher::new(
        db.clone(),
        events.clone(),
        app_state.subscribe_settings(),
        config.lifetime_threshold(),
    ));
    spawn_supervised("expiry_watcher", move || {
        let expiry = expiry.clone();
        async move { expiry.run().await }
    });

    let traffic = Arc::new(TrafficMonitor::new(
        db.clone(),
        context.reports.clone(),
        events,
        app_state.subscribe_settings(),
    ));
    spawn_supervised("traffic_monitor", move || {
        let traffic = traffic.clone();
        async move { traffic.run().await }
    });

    // --- Legacy gRPC listener ---
    let legacy = LegacyAgentService::new(
        context.clone(),
        app_state.subscribe_settings(),
        app_state.boot_time,
    );
    {
        let legacy = legacy.clone();
        spawn_supervised("legacy_reaper", move || legacy.clone().run_reaper());
    }
    if config.legacy_grpc_listen.is_empty() {
        info!("Legacy gRPC listener disabled.");
    } else {
        let addr: SocketAddr = config.legacy_grpc_listen.parse()?;
        info!(%addr, "Legacy gRPC listener starting.");
        tokio::spawn(async move {
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(NezhaServiceServer::new(legacy))
                .serve(addr)
                .await
            {
                error!(error = %e, "Legacy gRPC listener failed.");
            }
        });
    }

    // --- HTTP / WebSocket ---
    let router = create_axum_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "HTTP server listening.");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped.");
    Ok(())
}
