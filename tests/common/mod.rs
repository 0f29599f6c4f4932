#![allow(dead_code)]

use serde_json::{json, Value};
use socialmcp::{
    db,
    mcp::rpc::{self, Reply, RequestContext},
    AppState, Config,
};

pub async fn state() -> AppState {
    state_with(Config::default()).await
}

pub async fn state_with(config: Config) -> AppState {
    let db_pool = db::connect_in_memory().await.unwrap();
    AppState::new(db_pool, config).unwrap()
}

/// Drives the JSON-RPC layer the way one MCP client would.
pub struct Client<'a> {
    state: &'a AppState,
    pub session_id: String,
    pub api_key: Option<String>,
    next_id: u64,
}

pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl<'a> Client<'a> {
    pub fn new(state: &'a AppState, session_id: &str) -> Self {
        Client { state, session_id: session_id.to_owned(), api_key: None, next_id: 1 }
    }

    pub async fn send(&mut self, message: Value) -> Reply {
        let ctx = RequestContext {
            session_id: &self.session_id,
            api_key: self.api_key.as_deref(),
        };
        rpc::handle_body(self.state, ctx, message.to_string().as_bytes()).await
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        match self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })).await {
            Reply::Message(response) => {
                assert_eq!(response["id"], id);
                response
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    pub async fn call(&mut self, tool: &str, arguments: Value) -> ToolOutput {
        let response = self.request("tools/call", json!({ "name": tool, "arguments": arguments })).await;
        let result = &response["result"];
        assert!(result.is_object(), "tools/call failed: {response}");
        ToolOutput {
            text: result["content"][0]["text"].as_str().unwrap_or_default().to_owned(),
            is_error: result["isError"].as_bool().unwrap_or(false),
        }
    }

    /// Registers and returns the new profile id.
    pub async fn register(&mut self, display_name: &str, bio: &str) -> String {
        let out = self.call("social_register", json!({ "display_name": display_name, "bio": bio })).await;
        assert!(!out.is_error, "{}", out.text);
        line_value(&out.text, "Profile ID").to_owned()
    }
}

/// Value of a `Label: value` line in a tool result.
pub fn line_value<'t>(text: &'t str, label: &str) -> &'t str {
    text.lines()
        .find_map(|line| line.trim().strip_prefix(label)?.strip_prefix(": "))
        .unwrap_or_else(|| panic!("no {label:?} line in {text:?}"))
}
