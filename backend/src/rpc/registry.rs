use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::rpc::params::{bind_params, RpcParams};
use crate::rpc::protocol::{
    parse_payload, validate_request, Payload, RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION,
};
use crate::version::VERSION;

/// Caller classification, fixed when the connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Guest,
    Client,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Common,
    Guest,
    Rpc,
    Client,
    Admin,
}

impl Group {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "common" => Some(Group::Common),
            "guest" => Some(Group::Guest),
            "rpc" => Some(Group::Rpc),
            "client" => Some(Group::Client),
            "admin" => Some(Group::Admin),
            _ => None,
        }
    }

    pub fn required_permission(self) -> Permission {
        match self {
            Group::Common | Group::Guest | Group::Rpc => Permission::Guest,
            Group::Client => Permission::Client,
            Group::Admin => Permission::Admin,
        }
    }
}

pub const RESERVED_METHODS: [&str; 4] = ["rpc.methods", "rpc.version", "rpc.ping", "rpc.help"];

/// Splits `group:name`. A bare name belongs to `common`; `rpc.*` names are
/// the reserved introspection group.
pub fn qualify(method: &str) -> Option<(Group, String)> {
    if method.starts_with("rpc.") {
        return Some((Group::Rpc, method.to_owned()));
    }
    match method.split_once(':') {
        Some((group, name)) if !name.is_empty() => {
            Group::parse(group).map(|g| (g, format!("{group}:{name}")))
        }
        Some(_) => None,
        None => Some((Group::Common, format!("common:{method}"))),
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Method already registered: {0}")]
    Duplicate(String),
    #[error("Method name is reserved: {0}")]
    Reserved(String),
    #[error("Invalid method name: {0}")]
    InvalidName(String),
}

/// Implemented by whatever a method handler receives as its call context.
pub trait CallerContext: Clone + Send + Sync + 'static {
    fn permission(&self) -> Permission;
}

type Handler<C> = Arc<dyn Fn(C, Option<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

struct MethodEntry<C> {
    group: Group,
    summary: &'static str,
    handler: Handler<C>,
}

pub struct MethodRegistry<C> {
    methods: BTreeMap<String, MethodEntry<C>>,
}

impl<C: CallerContext> Default for MethodRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CallerContext> MethodRegistry<C> {
    pub fn new() -> Self {
        Self {
            methods: BTreeMap::new(),
        }
    }

    /// Registers a handler over raw params.
    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        summary: &'static str,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        F: Fn(C, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let (group, qualified) =
            qualify(name).ok_or_else(|| RegistrationError::InvalidName(name.to_owned()))?;
        if group == Group::Rpc {
            return Err(RegistrationError::Reserved(name.to_owned()));
        }
        if self.methods.contains_key(&qualified) {
            return Err(RegistrationError::Duplicate(qualified));
        }
        let handler: Handler<C> = Arc::new(move |ctx, params| handler(ctx, params).boxed());
        self.methods.insert(
            qualified,
            MethodEntry {
                group,
                summary,
                handler,
            },
        );
        Ok(())
    }

    /// Registers a handler whose params are bound onto `P` and whose result
    /// is serialized from `R`.
    pub fn register_typed<P, R, F, Fut>(
        &mut self,
        name: &str,
        summary: &'static str,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        P: RpcParams + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(C, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, summary, move |ctx: C, raw: Option<Value>| {
            let handler = handler.clone();
            async move {
                let params = bind_params::<P>(raw)?;
                let result = handler(ctx, params).await?;
                serde_json::to_value(result).map_err(RpcError::internal)
            }
        })
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = RESERVED_METHODS.iter().map(|m| (*m).to_owned()).collect();
        names.extend(self.methods.keys().cloned());
        names
    }

    fn introspect(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "rpc.methods" => Ok(json!(self.method_names())),
            "rpc.version" => Ok(json!({ "version": VERSION, "jsonrpc": JSONRPC_VERSION })),
            "rpc.ping" => Ok(json!("pong")),
            "rpc.help" => {
                let target = match params {
                    Some(Value::String(name)) => name,
                    Some(Value::Array(items)) => items
                        .into_iter()
                        .next()
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .unwrap_or_default(),
                    Some(Value::Object(map)) => map
                        .get("method")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                let (_, qualified) =
                    qualify(&target).ok_or_else(|| RpcError::method_not_found(&target))?;
                let entry = self
                    .methods
                    .get(&qualified)
                    .ok_or_else(|| RpcError::method_not_found(&target))?;
                Ok(json!({
                    "method": qualified,
                    "group": entry.group,
                    "permission": entry.group.required_permission(),
                    "summary": entry.summary,
                }))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }

    async fn execute(&self, ctx: C, request: RpcRequest) -> Result<Value, RpcError> {
        let (group, qualified) =
            qualify(&request.method).ok_or_else(|| RpcError::method_not_found(&request.method))?;
        if group == Group::Rpc {
            return self.introspect(&request.method, request.params);
        }
        let entry = self
            .methods
            .get(&qualified)
            .ok_or_else(|| RpcError::method_not_found(&request.method))?;
        if ctx.permission() < group.required_permission() {
            return Err(RpcError::unauthorized(&qualified));
        }
        let handler = entry.handler.clone();
        handler(ctx, request.params).await
    }

    /// Runs one envelope. Notifications yield no response.
    pub async fn call(&self, ctx: C, value: Value) -> Option<RpcResponse> {
        let request = match validate_request(value) {
            Ok(request) => request,
            Err((id, error)) => return Some(RpcResponse::failure(id, error)),
        };
        let id = request.id.clone();
        let method = request.method.clone();
        let outcome = self.execute(ctx, request).await;
        if let Err(e) = &outcome {
            debug!(method = %method, code = e.code, error = %e.message, "RPC call failed.");
        }
        let id = id?;
        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        })
    }

    /// Handles a whole text payload, single or batch, and returns the encoded
    /// reply if one is owed. Batch members run concurrently and answer in
    /// request order.
    pub async fn handle_text(&self, ctx: C, text: &str) -> Option<String> {
        let reply = match parse_payload(text) {
            Err(error) => json!(RpcResponse::failure(Value::Null, error)),
            Ok(Payload::Single(value)) => json!(self.call(ctx, value).await?),
            Ok(Payload::Batch(items)) if items.is_empty() => json!(RpcResponse::failure(
                Value::Null,
                RpcError::invalid_request("Empty batch")
            )),
            Ok(Payload::Batch(items)) => {
                let calls = items.into_iter().map(|item| self.call(ctx.clone(), item));
                let responses: Vec<RpcResponse> =
                    join_all(calls).await.into_iter().flatten().collect();
                if responses.is_empty() {
                    return None;
                }
                json!(responses)
            }
        };
        Some(reply.to_string())
    }
}
