use axum::{
    http::Method,
    middleware as axum_middleware,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::alerting::evaluation_service::{LoadEvaluator, LoadRuleScheduler};
use crate::alerting::offline_monitor::OfflineMonitor;
use crate::notifications::service::EventSink;
use crate::rpc::methods::{build_registry, RpcContext};
use crate::rpc::registry::{MethodRegistry, RegistrationError};
use crate::server::agent_state::ConnectedAgents;
use crate::server::command_dispatcher::CommandDispatcher;
use crate::server::config::{RuntimeSettings, ServerConfig};
use crate::server::core_services::AgentStreamContext;
use crate::server::metric_buffer::MinuteBuffer;
use crate::server::ping_scheduler::PingScheduler;
use crate::server::report_cache::ReportCache;
use crate::server::terminal::TerminalBroker;
use crate::web::middleware::auth;

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;

pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<ServerConfig>,
    /// Current runtime settings. Workers hold receivers of this channel.
    pub settings: watch::Sender<RuntimeSettings>,
    pub agent_context: Arc<AgentStreamContext>,
    pub ping_scheduler: Arc<PingScheduler>,
    pub load_scheduler: Arc<LoadRuleScheduler>,
    pub dispatcher: CommandDispatcher,
    pub terminals: Arc<TerminalBroker>,
    pub rpc: Arc<MethodRegistry<RpcContext>>,
    pub events: EventSink,
    pub boot_time: DateTime<Utc>,
}

impl AppState {
    /// Wires the shared components. Nothing is spawned here.
    pub fn new(
        db: DatabaseConnection,
        config: Arc<ServerConfig>,
        events: EventSink,
    ) -> Result<Arc<Self>, RegistrationError> {
        let (settings, settings_rx) = watch::channel(config.settings.clone());
        let agents = ConnectedAgents::new();
        let presence = OfflineMonitor::new(events.clone(), settings_rx.clone(), Some(db.clone()));

        let agent_context = Arc::new(AgentStreamContext {
            db: db.clone(),
            agents: agents.clone(),
            reports: Arc::new(ReportCache::new()),
            buffer: Arc::new(MinuteBuffer::new()),
            presence,
        });

        let evaluator = Arc::new(LoadEvaluator::new(db.clone(), events.clone(), settings_rx));

        Ok(Arc::new(AppState {
            dispatcher: CommandDispatcher::new(agents.clone(), db.clone()),
            ping_scheduler: Arc::new(PingScheduler::new(agents.clone())),
            load_scheduler: Arc::new(LoadRuleScheduler::new(evaluator)),
            terminals: Arc::new(TerminalBroker::new(agents)),
            rpc: Arc::new(build_registry()?),
            agent_context,
            db,
            config,
            settings,
            events,
            boot_time: Utc::now(),
        }))
    }

    pub fn current_settings(&self) -> RuntimeSettings {
        self.settings.borrow().clone()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<RuntimeSettings> {
        self.settings.subscribe()
    }
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_axum_router(app_state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/api/health", get(health_check_handler))
        .route(
            "/api/clients/report",
            get(crate::server::ws_agent_handler::ws_agent_handler),
        )
        .route(
            "/api/clients/terminal",
            get(handlers::terminal_handler::agent_terminal_handler),
        )
        .route(
            "/api/clients",
            get(handlers::live_status_handler::live_status_handler),
        )
        .route(
            "/api/rpc2",
            get(crate::rpc::handler::rpc_ws_handler).post(crate::rpc::handler::rpc_http_handler),
        )
        .merge(
            routes::client_routes::client_router().route_layer(
                axum_middleware::from_fn_with_state(app_state.clone(), auth::require_client),
            ),
        )
        .nest(
            "/api/admin",
            routes::admin_routes::admin_router().route_layer(
                axum_middleware::from_fn_with_state(app_state.clone(), auth::require_admin),
            ),
        )
        .with_state(app_state.clone());

    if app_state.current_settings().allow_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}
