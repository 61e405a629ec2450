use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use nodewatch::db::{connect_in_memory, entities::client, services::client_service};
use nodewatch::notifications::service::event_channel;
use nodewatch::server::config::ServerConfig;
use nodewatch::web::{create_axum_router, AppState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_KEY: &str = "integration-admin-key";

async fn start_server() -> (SocketAddr, Arc<AppState>) {
    let db = connect_in_memory().await.unwrap();
    let config = ServerConfig {
        api_key: Some(API_KEY.to_string()),
        ..Default::default()
    };
    let state = AppState::new(db, Arc::new(config), event_channel(64).0).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_axum_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn new_client(state: &AppState, name: &str) -> client::Model {
    client_service::create_client(&state.db, name).await.unwrap()
}

async fn next_text(socket: &mut Socket) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return text.as_str().to_owned();
        }
    }
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

async fn connect_agent(addr: SocketAddr, token: &str) -> Socket {
    let url = format!("ws://{addr}/api/clients/report?token={token}");
    connect_async(url).await.unwrap().0
}

#[tokio::test]
async fn agent_reports_reach_the_live_cache() {
    let (addr, state) = start_server().await;
    let agent = new_client(&state, "alpha").await;
    let mut socket = connect_agent(addr, &agent.token).await;

    socket
        .send(Message::Text(json!({"cpu_usage": 33.0, "ram_used": 100}).to_string().into()))
        .await
        .unwrap();

    let context = state.agent_context.clone();
    let uuid = agent.uuid.clone();
    wait_until(|| context.agents.is_online(&uuid)).await;
    for _ in 0..100 {
        if context.reports.get(&uuid).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let report = context.reports.get(&uuid).await.unwrap();
    assert_eq!(report.cpu_usage, 33.0);
    assert_eq!(context.buffer.len_for(&uuid), 1);

    socket.close(None).await.unwrap();
    wait_until(|| !context.agents.is_online(&uuid)).await;
}

#[tokio::test]
async fn first_frame_token_authenticates() {
    let (addr, state) = start_server().await;
    let agent = new_client(&state, "beta").await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/api/clients/report"))
        .await
        .unwrap();
    socket
        .send(Message::Text(json!({"token": agent.token}).to_string().into()))
        .await
        .unwrap();

    let context = state.agent_context.clone();
    let uuid = agent.uuid.clone();
    wait_until(|| context.agents.is_online(&uuid)).await;
}

#[tokio::test]
async fn bad_token_is_refused_before_upgrade() {
    let (addr, _state) = start_server().await;
    let err = connect_async(format!("ws://{addr}/api/clients/report?token=nope"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn second_session_for_the_same_agent_is_rejected() {
    let (addr, state) = start_server().await;
    let agent = new_client(&state, "gamma").await;
    let _first = connect_agent(addr, &agent.token).await;

    let context = state.agent_context.clone();
    let uuid = agent.uuid.clone();
    wait_until(|| context.agents.is_online(&uuid)).await;
    let original = context.agents.get(&uuid).unwrap().connection_id;

    let mut second = connect_agent(addr, &agent.token).await;
    let reply: Value = serde_json::from_str(&next_text(&mut second).await).unwrap();
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Token already in use");

    assert_eq!(context.agents.get(&uuid).unwrap().connection_id, original);
}

#[tokio::test]
async fn live_status_answers_get() {
    let (addr, state) = start_server().await;
    let visible = new_client(&state, "shown").await;
    let hidden = new_client(&state, "hidden").await;
    client_service::update_client(
        &state.db,
        &hidden.uuid,
        client_service::ClientUpdate {
            hidden: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let _a = connect_agent(addr, &visible.token).await;
    let _b = connect_agent(addr, &hidden.token).await;
    let context = state.agent_context.clone();
    let (v, h) = (visible.uuid.clone(), hidden.uuid.clone());
    wait_until(|| context.agents.is_online(&v) && context.agents.is_online(&h)).await;

    let (mut viewer, _) = connect_async(format!("ws://{addr}/api/clients")).await.unwrap();
    viewer.send(Message::Text("get".into())).await.unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut viewer).await).unwrap();
    assert_eq!(reply["status"], "success");
    let online: Vec<&str> = reply["data"]["online"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(online, vec![visible.uuid.as_str()]);
}

#[tokio::test]
async fn rpc_over_websocket_answers_in_request_order() {
    let (addr, _state) = start_server().await;
    let (mut rpc, _) = connect_async(format!("ws://{addr}/api/rpc2")).await.unwrap();

    rpc.send(Message::Text(
        json!({"jsonrpc": "2.0", "method": "rpc.ping", "id": 1}).to_string().into(),
    ))
    .await
    .unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut rpc).await).unwrap();
    assert_eq!(reply["result"], "pong");
    assert_eq!(reply["id"], 1);

    let batch = json!([
        {"jsonrpc": "2.0", "method": "getMe", "id": "a"},
        {"jsonrpc": "2.0", "method": "admin:listPingTasks", "id": "b"},
        {"jsonrpc": "2.0", "method": "rpc.ping"}
    ]);
    rpc.send(Message::Text(batch.to_string().into())).await.unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut rpc).await).unwrap();
    let replies = reply.as_array().unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["id"], "a");
    assert_eq!(replies[1]["error"]["code"], 401);
}

#[tokio::test]
async fn exec_over_http_rpc_collects_agent_results() {
    let (addr, state) = start_server().await;
    let agent = new_client(&state, "delta").await;
    let mut socket = connect_agent(addr, &agent.token).await;
    let context = state.agent_context.clone();
    let uuid = agent.uuid.clone();
    wait_until(|| context.agents.is_online(&uuid)).await;

    let http = reqwest::Client::new();
    let url = format!("http://{addr}/api/rpc2");
    let reply: Value = http
        .post(&url)
        .header("x-api-key", API_KEY)
        .body(
            json!({
                "jsonrpc": "2.0",
                "method": "admin:exec",
                "params": {"command": "uptime", "clients": [agent.uuid]},
                "id": 1
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = reply["result"]["task_id"].as_str().unwrap().to_owned();

    let frame: Value = serde_json::from_str(&next_text(&mut socket).await).unwrap();
    assert_eq!(frame["message"], "exec");
    assert_eq!(frame["task_id"], task_id.as_str());
    assert_eq!(frame["command"], "uptime");

    socket
        .send(Message::Text(
            json!({"type": "task_result", "task_id": task_id, "result": "up 3 days", "exit_code": 0})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let mut stored = Value::Null;
    for _ in 0..100 {
        let reply: Value = http
            .post(&url)
            .header("x-api-key", API_KEY)
            .body(
                json!({
                    "jsonrpc": "2.0",
                    "method": "admin:getTaskResults",
                    "params": [task_id],
                    "id": 2
                })
                .to_string(),
            )
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if reply["result"][0]["exit_code"] == 0 {
            stored = reply;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored["result"][0]["result"], "up 3 days");
}

#[tokio::test]
async fn rpc_notification_over_http_has_no_body() {
    let (addr, _state) = start_server().await;
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/rpc2"))
        .body(json!({"jsonrpc": "2.0", "method": "rpc.ping"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}
