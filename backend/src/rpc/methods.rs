use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::entities::{client, load_notification, offline_notification, ping_record, ping_task, record, task_result};
use crate::db::services::alert_service::{self, NewLoadRule};
use crate::db::services::client_service::{self, BasicInfo, ClientUpdate};
use crate::db::services::ping_service::{self, NewPingTask};
use crate::db::services::{record_service, task_service};
use crate::rpc::params::{NoParams, RpcParams};
use crate::rpc::protocol::{RpcError, UNAUTHORIZED};
use crate::rpc::registry::{CallerContext, MethodRegistry, Permission, RegistrationError};
use crate::server::command_dispatcher::{DispatchedTask, DispatcherError};
use crate::server::config::{RuntimeSettings, RuntimeSettingsPatch};
use crate::version::VERSION;
use crate::web::handlers::live_status_handler::{ensure_visible, live_status, LiveStatus};
use crate::web::middleware::auth::Caller;
use crate::web::AppState;

/// Default look-back for history reads without an explicit range.
const DEFAULT_HISTORY_HOURS: i64 = 1;

#[derive(Clone)]
pub struct RpcContext {
    pub state: Arc<AppState>,
    pub caller: Caller,
}

impl RpcContext {
    pub fn new(state: Arc<AppState>, caller: Caller) -> Self {
        Self { state, caller }
    }

    fn ensure_visible(&self) -> Result<(), RpcError> {
        ensure_visible(&self.state, &self.caller)
            .map_err(|e| RpcError::new(UNAUTHORIZED, e.message()))
    }

    /// Hidden clients look absent to everyone but admins.
    async fn visible_client(&self, uuid: &str) -> Result<client::Model, RpcError> {
        self.ensure_visible()?;
        match client_service::get_client_by_uuid(&self.state.db, uuid).await? {
            Some(c) if !c.hidden || self.caller.is_admin() => Ok(c),
            _ => Err(RpcError::invalid_params(format!("client {uuid} not found"))),
        }
    }
}

impl CallerContext for RpcContext {
    fn permission(&self) -> Permission {
        self.caller.permission
    }
}

// --- Parameter sets ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UuidParams {
    pub uuid: Option<String>,
}

impl RpcParams for UuidParams {
    const FIELDS: &'static [&'static str] = &["uuid"];
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HistoryParams {
    pub uuid: String,
    pub hours: i64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub task_id: Option<i32>,
}

impl RpcParams for HistoryParams {
    const FIELDS: &'static [&'static str] = &["uuid", "hours", "start", "end", "task_id"];
}

impl HistoryParams {
    fn range(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), RpcError> {
        let end = self.end.unwrap_or(now);
        let hours = if self.hours > 0 { self.hours } else { DEFAULT_HISTORY_HOURS };
        let start = self.start.unwrap_or(end - Duration::hours(hours));
        if start > end {
            return Err(RpcError::invalid_params("start is after end"));
        }
        Ok((start, end))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IdParams {
    pub id: i32,
}

impl RpcParams for IdParams {
    const FIELDS: &'static [&'static str] = &["id"];
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientParams {
    pub uuid: String,
}

impl RpcParams for ClientParams {
    const FIELDS: &'static [&'static str] = &["uuid"];
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewClientParams {
    pub name: String,
}

impl RpcParams for NewClientParams {
    const FIELDS: &'static [&'static str] = &["name"];
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EditClientParams {
    pub uuid: String,
    #[serde(flatten)]
    pub update: ClientUpdate,
}

impl RpcParams for EditClientParams {
    const FIELDS: &'static [&'static str] = &[
        "uuid",
        "name",
        "weight",
        "hidden",
        "expired_at",
        "billing_cycle",
        "auto_renewal",
        "traffic_limit",
        "traffic_limit_type",
    ];
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OfflineRuleParams {
    pub client: String,
    pub enable: bool,
    pub grace_period: i32,
}

impl RpcParams for OfflineRuleParams {
    const FIELDS: &'static [&'static str] = &["client", "enable", "grace_period"];
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecParams {
    pub command: String,
    pub clients: Vec<String>,
}

impl RpcParams for ExecParams {
    const FIELDS: &'static [&'static str] = &["command", "clients"];
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TaskParams {
    pub task_id: String,
}

impl RpcParams for TaskParams {
    const FIELDS: &'static [&'static str] = &["task_id"];
}

impl RpcParams for BasicInfo {
    const FIELDS: &'static [&'static str] = &[
        "cpu_name",
        "cpu_cores",
        "mem_total",
        "swap_total",
        "disk_total",
        "os",
        "kernel_version",
        "virtualization",
        "arch",
        "gpu_name",
        "ipv4",
        "ipv6",
        "version",
    ];
}

impl RpcParams for NewPingTask {
    const FIELDS: &'static [&'static str] = &["name", "clients", "ping_type", "target", "interval"];
}

impl RpcParams for NewLoadRule {
    const FIELDS: &'static [&'static str] = &["name", "clients", "metric", "threshold", "ratio", "interval"];
}

impl RpcParams for RuntimeSettingsPatch {
    const FIELDS: &'static [&'static str] = &[
        "notification_enabled",
        "notification_method",
        "expire_notification_enabled",
        "expire_notification_lead_days",
        "record_preserve_hours",
        "ping_record_preserve_hours",
        "traffic_limit_percentage",
        "geo_ip_enabled",
        "allow_cors",
        "private_site",
    ];
}

#[derive(Debug, Serialize)]
pub struct Me {
    pub permission: Permission,
    pub logged_in: bool,
    pub client_id: Option<String>,
}

fn dispatcher_error(err: DispatcherError) -> RpcError {
    match err {
        DispatcherError::DatabaseError(e) => e.into(),
        other => RpcError::invalid_params(other),
    }
}

// --- common ---

async fn get_nodes(ctx: RpcContext, params: UuidParams) -> Result<Value, RpcError> {
    if let Some(uuid) = params.uuid {
        return Ok(json!(ctx.visible_client(&uuid).await?));
    }
    ctx.ensure_visible()?;
    let clients: Vec<client::Model> = client_service::list_clients(&ctx.state.db)
        .await?
        .into_iter()
        .filter(|c| !c.hidden || ctx.caller.is_admin())
        .collect();
    Ok(json!(clients))
}

async fn get_nodes_latest_status(ctx: RpcContext, params: UuidParams) -> Result<Value, RpcError> {
    ctx.ensure_visible()?;
    let status: LiveStatus = live_status(&ctx.state, &ctx.caller).await?;
    match params.uuid {
        Some(uuid) => Ok(json!({
            "online": status.online.contains(&uuid),
            "data": status.data.get(&uuid),
        })),
        None => Ok(json!(status)),
    }
}

async fn get_records(ctx: RpcContext, params: HistoryParams) -> Result<Vec<record::Model>, RpcError> {
    let client = ctx.visible_client(&params.uuid).await?;
    let now = Utc::now();
    let (start, end) = params.range(now)?;
    let rows = record_service::get_records_by_client_and_time(
        &ctx.state.db,
        &client.uuid,
        start,
        end,
        now,
        ctx.state.config.short_term_window(),
    )
    .await?;
    Ok(rows)
}

async fn get_ping_records(
    ctx: RpcContext,
    params: HistoryParams,
) -> Result<Vec<ping_record::Model>, RpcError> {
    let client = ctx.visible_client(&params.uuid).await?;
    let (start, end) = params.range(Utc::now())?;
    let rows =
        ping_service::get_ping_records(&ctx.state.db, &client.uuid, params.task_id, start, end).await?;
    Ok(rows)
}

async fn get_me(ctx: RpcContext, _: NoParams) -> Result<Me, RpcError> {
    Ok(Me {
        permission: ctx.caller.permission,
        logged_in: ctx.caller.is_admin(),
        client_id: ctx.caller.client_id,
    })
}

async fn get_version(_: RpcContext, _: NoParams) -> Result<Value, RpcError> {
    Ok(json!({ "version": VERSION }))
}

// --- client ---

async fn upload_basic_info(ctx: RpcContext, info: BasicInfo) -> Result<Value, RpcError> {
    let uuid = ctx
        .caller
        .client_id
        .ok_or_else(|| RpcError::invalid_params("caller is not an agent"))?;
    client_service::update_basic_info(&ctx.state.db, &uuid, info).await?;
    Ok(json!({ "status": "success" }))
}

// --- admin: probes and rules ---

async fn reload_ping_scheduler(state: &AppState) -> Result<(), RpcError> {
    state.ping_scheduler.reload_from_db(&state.db).await?;
    Ok(())
}

async fn reload_load_scheduler(state: &AppState) -> Result<(), RpcError> {
    state.load_scheduler.reload_from_db(&state.db).await?;
    Ok(())
}

async fn add_ping_task(ctx: RpcContext, task: NewPingTask) -> Result<ping_task::Model, RpcError> {
    task.validate().map_err(RpcError::invalid_params)?;
    let created = ping_service::add_ping_task(&ctx.state.db, task).await?;
    reload_ping_scheduler(&ctx.state).await?;
    info!(task_id = created.id, "Ping task added.");
    Ok(created)
}

async fn delete_ping_task(ctx: RpcContext, params: IdParams) -> Result<bool, RpcError> {
    let deleted = ping_service::delete_ping_task(&ctx.state.db, params.id).await?;
    reload_ping_scheduler(&ctx.state).await?;
    Ok(deleted)
}

async fn list_ping_tasks(ctx: RpcContext, _: NoParams) -> Result<Vec<ping_task::Model>, RpcError> {
    Ok(ping_service::list_ping_tasks(&ctx.state.db).await?)
}

async fn add_load_rule(
    ctx: RpcContext,
    rule: NewLoadRule,
) -> Result<load_notification::Model, RpcError> {
    rule.validate().map_err(RpcError::invalid_params)?;
    let created = alert_service::add_load_rule(&ctx.state.db, rule).await?;
    reload_load_scheduler(&ctx.state).await?;
    info!(rule_id = created.id, "Load rule added.");
    Ok(created)
}

async fn delete_load_rule(ctx: RpcContext, params: IdParams) -> Result<bool, RpcError> {
    let deleted = alert_service::delete_load_rule(&ctx.state.db, params.id).await?;
    reload_load_scheduler(&ctx.state).await?;
    Ok(deleted)
}

async fn list_load_rules(
    ctx: RpcContext,
    _: NoParams,
) -> Result<Vec<load_notification::Model>, RpcError> {
    Ok(alert_service::list_load_rules(&ctx.state.db).await?)
}

async fn set_offline_rule(
    ctx: RpcContext,
    params: OfflineRuleParams,
) -> Result<offline_notification::Model, RpcError> {
    if params.client.is_empty() {
        return Err(RpcError::invalid_params("client is required"));
    }
    let rule = alert_service::set_offline_rule(
        &ctx.state.db,
        &params.client,
        params.enable,
        params.grace_period,
    )
    .await?;
    ctx.state
        .agent_context
        .presence
        .reload_rules(&ctx.state.db)
        .await?;
    Ok(rule)
}

async fn list_offline_rules(
    ctx: RpcContext,
    _: NoParams,
) -> Result<Vec<offline_notification::Model>, RpcError> {
    Ok(alert_service::list_offline_rules(&ctx.state.db).await?)
}

// --- admin: tasks ---

async fn exec(ctx: RpcContext, params: ExecParams) -> Result<DispatchedTask, RpcError> {
    ctx.state
        .dispatcher
        .dispatch(&params.command, &params.clients)
        .await
        .map_err(dispatcher_error)
}

async fn get_task_results(
    ctx: RpcContext,
    params: TaskParams,
) -> Result<Vec<task_result::Model>, RpcError> {
    Ok(task_service::get_task_results(&ctx.state.db, &params.task_id).await?)
}

// --- admin: settings ---

async fn get_settings(ctx: RpcContext, _: NoParams) -> Result<RuntimeSettings, RpcError> {
    Ok(ctx.state.current_settings())
}

async fn update_settings(
    ctx: RpcContext,
    patch: RuntimeSettingsPatch,
) -> Result<RuntimeSettings, RpcError> {
    let mut failure = None;
    ctx.state.settings.send_if_modified(|settings| match settings.apply(patch) {
        Ok(()) => true,
        Err(e) => {
            failure = Some(e);
            false
        }
    });
    if let Some(e) = failure {
        return Err(RpcError::invalid_params(e));
    }
    info!("Runtime settings updated.");
    Ok(ctx.state.current_settings())
}

// --- admin: clients ---

async fn add_client(ctx: RpcContext, params: NewClientParams) -> Result<Value, RpcError> {
    let name = params.name.trim();
    if name.is_empty() {
        return Err(RpcError::invalid_params("name is required"));
    }
    let created = client_service::create_client(&ctx.state.db, name).await?;
    Ok(json!({ "uuid": created.uuid, "token": created.token, "name": created.name }))
}

async fn get_client_token(ctx: RpcContext, params: ClientParams) -> Result<Value, RpcError> {
    let c = client_service::get_client_by_uuid(&ctx.state.db, &params.uuid)
        .await?
        .ok_or_else(|| RpcError::invalid_params(format!("client {} not found", params.uuid)))?;
    Ok(json!({ "uuid": c.uuid, "token": c.token }))
}

async fn update_client(ctx: RpcContext, params: EditClientParams) -> Result<client::Model, RpcError> {
    if params.uuid.is_empty() {
        return Err(RpcError::invalid_params("uuid is required"));
    }
    if let Some(kind) = params.update.traffic_limit_type.as_deref() {
        if !["sum", "max", "min", "up", "down"].contains(&kind) {
            return Err(RpcError::invalid_params(format!("unsupported traffic_limit_type: {kind}")));
        }
    }
    Ok(client_service::update_client(&ctx.state.db, &params.uuid, params.update).await?)
}

async fn delete_client(ctx: RpcContext, params: ClientParams) -> Result<bool, RpcError> {
    let state = &ctx.state;
    if !client_service::delete_client(&state.db, &params.uuid).await? {
        return Ok(false);
    }
    let live = &state.agent_context;
    if let Some(session) = live.agents.get(&params.uuid) {
        live.close_session(&session).await;
    }
    live.presence.forget(&params.uuid).await;
    live.reports.remove(&params.uuid).await;
    live.buffer.remove(&params.uuid);
    if let Err(e) = reload_ping_scheduler(state).await {
        warn!(client = %params.uuid, error = %e.message, "Ping scheduler reload failed after delete.");
    }
    reload_load_scheduler(state).await?;
    info!(client = %params.uuid, "Client deleted.");
    Ok(true)
}

/// Every method the server exposes.
pub fn build_registry() -> Result<MethodRegistry<RpcContext>, RegistrationError> {
    let mut r = MethodRegistry::new();

    r.register_typed("common:getNodes", "Static info of visible clients", get_nodes)?;
    r.register_typed("common:getNodesLatestStatus", "Online set and latest reports", get_nodes_latest_status)?;
    r.register_typed("common:getRecords", "Blended metric history of a client", get_records)?;
    r.register_typed("common:getPingRecords", "Probe history of a client", get_ping_records)?;
    r.register_typed("common:getMe", "Caller permission", get_me)?;
    r.register_typed("common:getVersion", "Server version", get_version)?;

    r.register_typed("client:uploadBasicInfo", "Static host attributes from an agent", upload_basic_info)?;

    r.register_typed("admin:addPingTask", "Create a probe task", add_ping_task)?;
    r.register_typed("admin:deletePingTask", "Delete a probe task", delete_ping_task)?;
    r.register_typed("admin:listPingTasks", "List probe tasks", list_ping_tasks)?;
    r.register_typed("admin:addLoadRule", "Create a load rule", add_load_rule)?;
    r.register_typed("admin:deleteLoadRule", "Delete a load rule", delete_load_rule)?;
    r.register_typed("admin:listLoadRules", "List load rules", list_load_rules)?;
    r.register_typed("admin:setOfflineRule", "Set a client's offline rule", set_offline_rule)?;
    r.register_typed("admin:listOfflineRules", "List offline rules", list_offline_rules)?;
    r.register_typed("admin:exec", "Run a command on online clients", exec)?;
    r.register_typed("admin:getTaskResults", "Per-client results of a task", get_task_results)?;
    r.register_typed("admin:getSettings", "Current runtime settings", get_settings)?;
    r.register_typed("admin:updateSettings", "Patch runtime settings", update_settings)?;
    r.register_typed("admin:addClient", "Create a client and its token", add_client)?;
    r.register_typed("admin:getClientToken", "Token of a client", get_client_token)?;
    r.register_typed("admin:updateClient", "Edit a client", update_client)?;
    r.register_typed("admin:deleteClient", "Delete a client and its data", delete_client)?;

    Ok(r)
}
