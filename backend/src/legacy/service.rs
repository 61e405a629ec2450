use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::db::entities::client;
use crate::db::services::client_service::{self, BasicInfo};
use crate::legacy_proto::nezha_service_server::NezhaService;
use crate::legacy_proto::{
    GeoIpReport, Host, Receipt, State as LegacyState, Task as LegacyTask,
    TaskResult as LegacyTaskResult, Uint64Receipt,
};
use crate::server::agent_state::{next_connection_id, AgentSender, AgentSession};
use crate::server::config::RuntimeSettings;
use crate::server::core_services::AgentStreamContext;
use crate::server::report_cache::Report;

/// A legacy session with no frame for this long is considered gone.
pub const LEGACY_PRESENCE_TTL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const REAP_INTERVAL: Duration = Duration::from_secs(5);
/// Task type the old agent treats as a keepalive.
const KEEPALIVE_TASK_TYPE: u64 = 6;
const SECRET_METADATA: &str = "client_secret";
const UUID_METADATA: &str = "client_uuid";

#[derive(Clone)]
pub struct LegacyAgentService {
    context: Arc<AgentStreamContext>,
    settings: watch::Receiver<RuntimeSettings>,
    boot_time: DateTime<Utc>,
}

impl LegacyAgentService {
    pub fn new(
        context: Arc<AgentStreamContext>,
        settings: watch::Receiver<RuntimeSettings>,
        boot_time: DateTime<Utc>,
    ) -> Self {
        Self {
            context,
            settings,
            boot_time,
        }
    }

    async fn authenticate(&self, metadata: &MetadataMap) -> Result<client::Model, Status> {
        let secret = metadata
            .get(SECRET_METADATA)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Status::unauthenticated("Missing client secret"))?;
        let client = client_service::get_client_by_token(&self.context.db, secret)
            .await
            .map_err(|e| {
                error!(error = %e, "Legacy token lookup failed.");
                Status::internal("Database error")
            })?
            .ok_or_else(|| Status::unauthenticated("Invalid client secret"))?;
        if let Some(uuid) = metadata.get(UUID_METADATA).and_then(|v| v.to_str().ok()) {
            if !uuid.is_empty() && uuid != client.uuid {
                return Err(Status::unauthenticated("Client uuid does not match secret"));
            }
        }
        Ok(client)
    }

    /// Returns the agent's legacy session, opening one if the agent has none.
    /// A live WebSocket session wins over the old protocol.
    async fn attach(&self, agent_id: &str) -> Result<Arc<AgentSession>, Status> {
        if let Some(existing) = self.context.agents.get(agent_id) {
            if existing.accepts_push() {
                return Err(Status::already_exists("Token already in use"));
            }
            existing.touch();
            return Ok(existing);
        }
        self.context
            .open_session(agent_id, next_connection_id(), AgentSender::Legacy)
            .await
            .map_err(|e| Status::already_exists(e.to_string()))
    }

    fn refresh(&self, agent_id: &str) {
        if let Some(session) = self.context.agents.get(agent_id) {
            if !session.accepts_push() {
                session.touch();
            }
        }
    }

    async fn store_host(&self, request: Request<Host>) -> Result<(), Status> {
        let metadata = request.metadata().clone();
        let client = self.authenticate(&metadata).await?;
        let info = host_to_basic_info(request.into_inner());
        client_service::update_basic_info(&self.context.db, &client.uuid, info)
            .await
            .map_err(|e| {
                error!(client = %client.uuid, error = %e, "Failed to store legacy host info.");
                Status::internal("Database error")
            })?;
        debug!(client = %client.uuid, "Legacy host info stored.");
        Ok(())
    }

    /// Drives one state stream. The first frame opens presence, every frame
    /// refreshes it and lands in the report cache and minute buffer.
    async fn run_state_stream<S>(
        &self,
        client: client::Model,
        mut inbound: S,
        tx: mpsc::Sender<Result<Receipt, Status>>,
    ) where
        S: Stream<Item = Result<LegacyState, Status>> + Unpin + Send,
    {
        let mut session: Option<Arc<AgentSession>> = None;
        while let Some(next) = inbound.next().await {
            let state = match next {
                Ok(state) => state,
                Err(e) => {
                    debug!(client = %client.uuid, error = %e, "Legacy state stream ended.");
                    break;
                }
            };
            let current = match &session {
                Some(s) => s.clone(),
                None => match self.attach(&client.uuid).await {
                    Ok(s) => {
                        session = Some(s.clone());
                        s
                    }
                    Err(status) => {
                        warn!(client = %client.uuid, "Legacy state stream rejected.");
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                },
            };
            current.touch();
            self.context
                .ingest_report(&client.uuid, state_to_report(&state, &client))
                .await;
            if tx.send(Ok(Receipt { proced: true })).await.is_err() {
                break;
            }
        }
        // Presence outlives the stream until the reaper sees the TTL lapse.
    }

    /// Sends a keepalive task every interval and treats each incoming result
    /// as a presence refresh. The first keepalive goes out immediately.
    async fn run_task_stream<S>(
        &self,
        client: client::Model,
        mut inbound: S,
        tx: mpsc::Sender<Result<LegacyTask, Status>>,
    ) where
        S: Stream<Item = Result<LegacyTaskResult, Status>> + Unpin + Send,
    {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if tx.send(Ok(heartbeat())).await.is_err() {
                        break;
                    }
                }
                incoming = inbound.next() => match incoming {
                    Some(Ok(result)) => {
                        debug!(client = %client.uuid, task_id = result.id, "Legacy task result ignored.");
                        self.refresh(&client.uuid);
                    }
                    Some(Err(e)) => {
                        debug!(client = %client.uuid, error = %e, "Legacy task stream ended.");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    /// Closes every legacy session whose last frame is older than the TTL.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(LEGACY_PRESENCE_TTL).unwrap_or_default();
        let mut reaped = 0;
        for session in self.context.agents.snapshot().into_values() {
            if session.accepts_push() || now - session.last_seen() <= ttl {
                continue;
            }
            info!(client = %session.agent_id, connection_id = session.connection_id, "Legacy session expired.");
            self.context.close_session(&session).await;
            reaped += 1;
        }
        reaped
    }

    pub async fn run_reaper(self) {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            self.reap_expired(Utc::now()).await;
        }
    }
}

#[tonic::async_trait]
impl NezhaService for LegacyAgentService {
    type ReportSystemStateStream = ReceiverStream<Result<Receipt, Status>>;
    type RequestTaskStream = ReceiverStream<Result<LegacyTask, Status>>;

    async fn report_system_state(
        &self,
        request: Request<Streaming<LegacyState>>,
    ) -> Result<Response<Self::ReportSystemStateStream>, Status> {
        let metadata = request.metadata().clone();
        let client = self.authenticate(&metadata).await?;
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let service = self.clone();

        tokio::spawn(async move { service.run_state_stream(client, inbound, tx).await });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn report_system_info(&self, request: Request<Host>) -> Result<Response<Receipt>, Status> {
        self.store_host(request).await?;
        Ok(Response::new(Receipt { proced: true }))
    }

    async fn report_system_info2(
        &self,
        request: Request<Host>,
    ) -> Result<Response<Uint64Receipt>, Status> {
        self.store_host(request).await?;
        Ok(Response::new(Uint64Receipt {
            data: clamp_u64(self.boot_time.timestamp()),
        }))
    }

    async fn request_task(
        &self,
        request: Request<Streaming<LegacyTaskResult>>,
    ) -> Result<Response<Self::RequestTaskStream>, Status> {
        let metadata = request.metadata().clone();
        let client = self.authenticate(&metadata).await?;
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);
        let service = self.clone();

        tokio::spawn(async move { service.run_task_stream(client, inbound, tx).await });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn report_geo_ip(
        &self,
        request: Request<GeoIpReport>,
    ) -> Result<Response<GeoIpReport>, Status> {
        let metadata = request.metadata().clone();
        let client = self.authenticate(&metadata).await?;
        let mut report = request.into_inner();
        if self.settings.borrow().geo_ip_enabled {
            let (ipv4, ipv6) = report
                .ip
                .as_ref()
                .map(|ip| (non_empty(&ip.ipv4), non_empty(&ip.ipv6)))
                .unwrap_or_default();
            let region = non_empty(&report.country_code);
            if let Err(e) =
                client_service::update_geo(&self.context.db, &client.uuid, ipv4, ipv6, region).await
            {
                error!(client = %client.uuid, error = %e, "Failed to store legacy geo report.");
                return Err(Status::internal("Database error"));
            }
        }
        report.dashboard_boot_time = clamp_u64(self.boot_time.timestamp());
        Ok(Response::new(report))
    }
}

fn heartbeat() -> LegacyTask {
    LegacyTask {
        id: 0,
        r#type: KEEPALIVE_TASK_TYPE,
        data: String::new(),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn clamp_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Splits `"<model> <n> Virtual Core"` into the model name and core count.
fn split_cpu(entry: &str) -> (String, i32) {
    let words: Vec<&str> = entry.split_whitespace().collect();
    if let [model @ .., count, kind, "Core"] = words.as_slice() {
        if matches!(*kind, "Virtual" | "Physical") {
            if let Ok(n) = count.parse::<i32>() {
                return (model.join(" "), n);
            }
        }
    }
    (entry.trim().to_owned(), 1)
}

pub fn host_to_basic_info(host: Host) -> BasicInfo {
    let mut cpu_name = String::new();
    let mut cpu_cores = 0;
    for entry in &host.cpu {
        let (name, cores) = split_cpu(entry);
        if cpu_name.is_empty() {
            cpu_name = name;
        }
        cpu_cores += cores;
    }
    BasicInfo {
        cpu_name,
        cpu_cores,
        mem_total: clamp_i64(host.mem_total),
        swap_total: clamp_i64(host.swap_total),
        disk_total: clamp_i64(host.disk_total),
        os: host.platform,
        kernel_version: host.platform_version,
        virtualization: host.virtualization,
        arch: host.arch,
        gpu_name: host.gpu.join(", "),
        ipv4: None,
        ipv6: None,
        version: host.version,
    }
}

/// The old protocol carries no totals per sample; they come from the
/// client's static record.
pub fn state_to_report(state: &LegacyState, client: &client::Model) -> Report {
    let temp = state
        .temperatures
        .iter()
        .map(|t| t.temperature)
        .fold(0.0, f64::max);
    Report {
        cpu_usage: state.cpu,
        gpu_usage: state.gpu,
        ram_used: clamp_i64(state.mem_used),
        ram_total: client.mem_total,
        swap_used: clamp_i64(state.swap_used),
        swap_total: client.swap_total,
        disk_used: clamp_i64(state.disk_used),
        disk_total: client.disk_total,
        load1: state.load1,
        load5: state.load5,
        load15: state.load15,
        temp,
        net_up: clamp_i64(state.net_out_speed),
        net_down: clamp_i64(state.net_in_speed),
        net_total_up: clamp_i64(state.net_out_transfer),
        net_total_down: clamp_i64(state.net_in_transfer),
        uptime: clamp_i64(state.uptime),
        process_count: clamp_i64(state.process_count),
        tcp_conns: clamp_i64(state.tcp_conn_count),
        udp_conns: clamp_i64(state.udp_conn_count),
        updated_at: Utc::now(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::legacy_proto::{IpAddrs, SensorTemperature};
    use crate::notifications::service::event_channel;
    use crate::server::agent_state::channel_session;
    use crate::server::config::ServerConfig;
    use crate::web::AppState;

    async fn service() -> (LegacyAgentService, Arc<AppState>) {
        let db = connect_in_memory().await.unwrap();
        let state = AppState::new(db, Arc::new(ServerConfig::default()), event_channel(16).0).unwrap();
        let service = LegacyAgentService::new(
            state.agent_context.clone(),
            state.subscribe_settings(),
            state.boot_time,
        );
        (service, state)
    }

    fn signed<T>(message: T, secret: &str) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(SECRET_METADATA, secret.parse().unwrap());
        request
    }

    #[test]
    fn cpu_entries_split_into_model_and_cores() {
        assert_eq!(
            split_cpu("AMD EPYC 7B12 4 Virtual Core"),
            ("AMD EPYC 7B12".to_string(), 4)
        );
        assert_eq!(split_cpu("Apple M1"), ("Apple M1".to_string(), 1));

        let info = host_to_basic_info(Host {
            platform: "debian".into(),
            platform_version: "12".into(),
            cpu: vec!["Xeon 2 Physical Core".into(), "Xeon 2 Physical Core".into()],
            gpu: vec!["A".into(), "B".into()],
            mem_total: 1024,
            ..Default::default()
        });
        assert_eq!(info.cpu_name, "Xeon");
        assert_eq!(info.cpu_cores, 4);
        assert_eq!(info.gpu_name, "A, B");
        assert_eq!(info.mem_total, 1024);
        assert_eq!(info.os, "debian");
    }

    #[tokio::test]
    async fn state_uses_static_totals_and_hottest_sensor() {
        let (_, state) = service().await;
        let mut client = client_service::create_client(&state.db, "old").await.unwrap();
        client.mem_total = 8000;
        client.disk_total = 9000;
        let report = state_to_report(
            &LegacyState {
                cpu: 12.0,
                mem_used: 4000,
                net_in_speed: 10,
                net_out_speed: 20,
                temperatures: vec![
                    SensorTemperature { name: "a".into(), temperature: 41.0 },
                    SensorTemperature { name: "b".into(), temperature: 55.5 },
                ],
                ..Default::default()
            },
            &client,
        );
        assert_eq!(report.ram_total, 8000);
        assert_eq!(report.disk_total, 9000);
        assert_eq!(report.ram_used, 4000);
        assert_eq!(report.net_down, 10);
        assert_eq!(report.net_up, 20);
        assert_eq!(report.temp, 55.5);
    }

    #[tokio::test]
    async fn host_report_requires_a_valid_secret() {
        let (service, state) = service().await;
        let client = client_service::create_client(&state.db, "old").await.unwrap();

        let denied = service
            .report_system_info(signed(Host::default(), "wrong"))
            .await
            .unwrap_err();
        assert_eq!(denied.code(), tonic::Code::Unauthenticated);

        let host = Host {
            platform: "alpine".into(),
            mem_total: 2048,
            ..Default::default()
        };
        let reply = service
            .report_system_info2(signed(host, &client.token))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.data, state.boot_time.timestamp() as u64);

        let stored = client_service::get_client_by_uuid(&state.db, &client.uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.os, "alpine");
        assert_eq!(stored.mem_total, 2048);
    }

    #[tokio::test]
    async fn geo_report_is_stored_only_when_enabled() {
        let (service, state) = service().await;
        let client = client_service::create_client(&state.db, "old").await.unwrap();
        let report = || GeoIpReport {
            use6: false,
            ip: Some(IpAddrs {
                ipv4: "203.0.113.7".into(),
                ipv6: String::new(),
            }),
            country_code: "nl".into(),
            dashboard_boot_time: 0,
        };

        let reply = service
            .report_geo_ip(signed(report(), &client.token))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.dashboard_boot_time, state.boot_time.timestamp() as u64);
        let stored = client_service::get_client_by_uuid(&state.db, &client.uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.ipv4, None);

        state.settings.send_modify(|s| s.geo_ip_enabled = true);
        service
            .report_geo_ip(signed(report(), &client.token))
            .await
            .unwrap();
        let stored = client_service::get_client_by_uuid(&state.db, &client.uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.ipv4.as_deref(), Some("203.0.113.7"));
        assert_eq!(stored.region, "nl");
    }

    #[tokio::test]
    async fn legacy_sessions_are_shared_and_reaped_after_ttl() {
        let (service, state) = service().await;
        let client = client_service::create_client(&state.db, "old").await.unwrap();

        let first = service.attach(&client.uuid).await.unwrap();
        let again = service.attach(&client.uuid).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(state.agent_context.agents.is_online(&client.uuid));

        assert_eq!(service.reap_expired(Utc::now()).await, 0);
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(service.reap_expired(later).await, 1);
        assert!(!state.agent_context.agents.is_online(&client.uuid));
    }

    #[tokio::test]
    async fn state_stream_opens_presence_and_ingests_each_frame() {
        let (service, state) = service().await;
        let client = client_service::create_client(&state.db, "old").await.unwrap();
        let agents = state.agent_context.agents.clone();
        let (frames, inbound) = mpsc::channel(4);
        let (tx, mut receipts) = mpsc::channel(4);
        let worker = {
            let service = service.clone();
            let client = client.clone();
            tokio::spawn(async move {
                service
                    .run_state_stream(client, ReceiverStream::new(inbound), tx)
                    .await
            })
        };
        assert!(!agents.is_online(&client.uuid));

        frames
            .send(Ok(LegacyState { cpu: 42.0, ..Default::default() }))
            .await
            .unwrap();
        assert!(receipts.recv().await.unwrap().unwrap().proced);
        assert!(agents.is_online(&client.uuid));
        let cached = state.agent_context.reports.get(&client.uuid).await.unwrap();
        assert_eq!(cached.cpu_usage, 42.0);
        assert_eq!(state.agent_context.buffer.len_for(&client.uuid), 1);

        let session = agents.get(&client.uuid).unwrap();
        let first_seen = session.last_seen();
        tokio::time::sleep(Duration::from_millis(5)).await;
        frames
            .send(Ok(LegacyState { cpu: 43.0, ..Default::default() }))
            .await
            .unwrap();
        assert!(receipts.recv().await.unwrap().unwrap().proced);
        assert!(session.last_seen() > first_seen);
        assert_eq!(state.agent_context.buffer.len_for(&client.uuid), 2);

        drop(frames);
        worker.await.unwrap();
        assert!(agents.is_online(&client.uuid));
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(service.reap_expired(later).await, 1);
    }

    #[tokio::test]
    async fn state_stream_is_refused_while_websocket_session_is_live() {
        let (service, state) = service().await;
        let client = client_service::create_client(&state.db, "new").await.unwrap();
        let (session, _rx) = channel_session(&client.uuid);
        state.agent_context.agents.register(session).unwrap();

        let (tx, mut receipts) = mpsc::channel(4);
        let inbound = futures::stream::iter(vec![Ok(LegacyState::default())]);
        service.run_state_stream(client.clone(), inbound, tx).await;

        let status = receipts.recv().await.unwrap().err().unwrap();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
        assert!(state.agent_context.reports.get(&client.uuid).await.is_none());
    }

    #[tokio::test]
    async fn task_stream_sends_keepalives_and_refreshes_presence() {
        let (service, state) = service().await;
        let client = client_service::create_client(&state.db, "old").await.unwrap();
        let session = service.attach(&client.uuid).await.unwrap();
        let (results, inbound) = mpsc::channel(4);
        let (tx, mut tasks) = mpsc::channel(4);
        let worker = {
            let service = service.clone();
            let client = client.clone();
            tokio::spawn(async move {
                service
                    .run_task_stream(client, ReceiverStream::new(inbound), tx)
                    .await
            })
        };

        let first = tasks.recv().await.unwrap().unwrap();
        assert_eq!(first.r#type, KEEPALIVE_TASK_TYPE);

        let before = session.last_seen();
        std::thread::sleep(Duration::from_millis(5));
        results
            .send(Ok(LegacyTaskResult { id: 9, ..Default::default() }))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while session.last_seen() <= before {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tokio::time::pause();
        tokio::time::advance(HEARTBEAT_INTERVAL).await;
        let second = tasks.recv().await.unwrap().unwrap();
        assert_eq!(second.r#type, KEEPALIVE_TASK_TYPE);
        assert_eq!(second.id, 0);

        drop(results);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn websocket_session_blocks_legacy_attach() {
        let (service, state) = service().await;
        let client = client_service::create_client(&state.db, "new").await.unwrap();
        let (session, _rx) = channel_session(&client.uuid);
        state.agent_context.agents.register(session).unwrap();

        let err = service.attach(&client.uuid).await.err().unwrap();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(service.reap_expired(later).await, 0);
    }
}
