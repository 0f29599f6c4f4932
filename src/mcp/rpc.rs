use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    auth::AuthInputs,
    mcp::{
        dispatch::{self, Caller},
        tools::{self, ToolCall, ToolParseError, ToolResult},
    },
    AppError, AppState, FieldError, GetField,
};

pub const JSONRPC_VERSION: &str = "2.0";
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2024-11-05", "2025-03-26", "2025-06-18"];
pub const SERVER_NAME: &str = "social-mcp";

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse(_) => -32700,
            RpcError::InvalidRequest(_) => -32600,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::InvalidParams(_) => -32602,
            RpcError::Internal(_) => -32603,
        }
    }
}

impl From<AppError> for RpcError {
    fn from(err: AppError) -> Self {
        tracing::error!(error = %err, "tool call failed");
        RpcError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Response { jsonrpc: JSONRPC_VERSION, id, result: Some(result), error: None }
    }

    pub fn failure(id: Value, err: &RpcError) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(ErrorObject { code: err.code(), message: err.to_string() }),
        }
    }

    fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Transport-level facts about one inbound HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub session_id: &'a str,
    pub api_key: Option<&'a str>,
}

/// What the transport should send back for one POST body.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Only notifications were received.
    Nothing,
    Message(Value),
    /// The body was not JSON at all.
    ParseError(Value),
}

pub async fn handle_body(state: &AppState, ctx: RequestContext<'_>, body: &[u8]) -> Reply {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(session = ctx.session_id, error = %err, "unparseable body");
            return Reply::ParseError(Response::failure(Value::Null, &RpcError::Parse(err.to_string())).into_value());
        }
    };

    match parsed {
        Value::Array(batch) if batch.is_empty() => {
            Reply::Message(Response::failure(Value::Null, &RpcError::InvalidRequest("empty batch".to_owned())).into_value())
        }
        Value::Array(batch) => {
            let mut replies = Vec::new();
            for message in batch {
                if let Some(reply) = handle_message(state, ctx, message).await {
                    replies.push(reply);
                }
            }
            if replies.is_empty() { Reply::Nothing } else { Reply::Message(Value::Array(replies)) }
        }
        message => match handle_message(state, ctx, message).await {
            Some(reply) => Reply::Message(reply),
            None => Reply::Nothing,
        },
    }
}

/// Handles one envelope. Returns `None` for notifications.
pub async fn handle_message(state: &AppState, ctx: RequestContext<'_>, message: Value) -> Option<Value> {
    let Value::Object(mut envelope) = message else {
        return Some(Response::failure(Value::Null, &RpcError::InvalidRequest("expected an object".to_owned())).into_value());
    };

    let id = envelope.remove("id");
    if envelope.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        let err = RpcError::InvalidRequest("jsonrpc must be \"2.0\"".to_owned());
        return Some(Response::failure(id.unwrap_or(Value::Null), &err).into_value());
    }
    let Some(Value::String(method)) = envelope.remove("method") else {
        let err = RpcError::InvalidRequest("method must be a string".to_owned());
        return Some(Response::failure(id.unwrap_or(Value::Null), &err).into_value());
    };
    let params = envelope.remove("params").unwrap_or(Value::Null);

    let result = handle_method(state, ctx, &method, params).await;
    let Some(id) = id else {
        if let Err(err) = result {
            tracing::debug!(session = ctx.session_id, method = %method, error = %err, "notification failed");
        }
        return None;
    };

    Some(match result {
        Ok(result) => Response::success(id, result),
        Err(err) => {
            tracing::debug!(session = ctx.session_id, method = %method, code = err.code(), error = %err, "rpc error");
            Response::failure(id, &err)
        }
    }.into_value())
}

pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|requested| SUPPORTED_PROTOCOL_VERSIONS.into_iter().find(|&v| v == requested))
        .unwrap_or(DEFAULT_PROTOCOL_VERSION)
}

async fn handle_method(state: &AppState, ctx: RequestContext<'_>, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "initialize" => {
            let requested = params.get_opt_str_field("protocolVersion").ok().flatten();
            Ok(json!({
                "protocolVersion": negotiate_version(requested),
                "capabilities": { "tools": {}, "logging": {} },
                "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
            }))
        }
        "initialized" | "notifications/initialized" | "notifications/cancelled" | "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tools::catalog() })),
        "resources/list" => Ok(json!({ "resources": [] })),
        "prompts/list" => Ok(json!({ "prompts": [] })),
        "tools/call" => {
            let result = call_tool(state, ctx, params).await?;
            serde_json::to_value(result).map_err(|err| RpcError::Internal(err.to_string()))
        }
        other => Err(RpcError::MethodNotFound(other.to_owned())),
    }
}

async fn call_tool(state: &AppState, ctx: RequestContext<'_>, params: Value) -> Result<ToolResult, RpcError> {
    let name = params.get_str_field("name")
        .map_err(|err| RpcError::InvalidParams(err.to_string()))?;
    let arguments = match params.get_obj_field("arguments") {
        Ok(arguments) => arguments.clone(),
        Err(FieldError::Missing(_)) => Value::Null,
        Err(err) => return Err(RpcError::InvalidParams(err.to_string())),
    };

    let inputs = AuthInputs {
        api_key: ctx.api_key,
        session_id: Some(ctx.session_id),
        profile_id: arguments.get_opt_str_field("profile_id").ok().flatten(),
    };
    let identity = state.auth.resolve(&state.db_pool, &inputs).await?;

    let call = match ToolCall::parse(name, arguments.clone()) {
        Ok(call) => call,
        Err(err @ ToolParseError::UnknownTool(_)) => {
            tracing::debug!(session = ctx.session_id, tool = name, "unknown tool");
            return Ok(ToolResult::error(err.to_string()));
        }
        Err(err) => return Ok(ToolResult::error(err.to_string())),
    };

    tracing::info!(
        session = ctx.session_id,
        tool = name,
        profile = identity.as_ref().map(|i| i.profile_id.as_str()).unwrap_or("-"),
        "tool call"
    );
    let caller = Caller { session_id: ctx.session_id, identity };
    Ok(dispatch::dispatch(state, &caller, call).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_json_rpc() {
        assert_eq!(RpcError::Parse(String::new()).code(), -32700);
        assert_eq!(RpcError::InvalidRequest(String::new()).code(), -32600);
        assert_eq!(RpcError::MethodNotFound(String::new()).code(), -32601);
        assert_eq!(RpcError::InvalidParams(String::new()).code(), -32602);
        assert_eq!(RpcError::Internal(String::new()).code(), -32603);
    }

    #[test]
    fn unknown_protocol_versions_fall_back() {
        assert_eq!(negotiate_version(Some("2025-03-26")), "2025-03-26");
        assert_eq!(negotiate_version(Some("1999-01-01")), DEFAULT_PROTOCOL_VERSION);
        assert_eq!(negotiate_version(None), DEFAULT_PROTOCOL_VERSION);
    }

    #[test]
    fn responses_carry_either_result_or_error() {
        let ok = Response::success(json!(1), json!({})).into_value();
        assert_eq!(ok, json!({ "jsonrpc": "2.0", "id": 1, "result": {} }));

        let err = Response::failure(json!("a"), &RpcError::MethodNotFound("x".into())).into_value();
        assert_eq!(err["error"]["code"], -32601);
        assert!(err.get("result").is_none());
    }
}
