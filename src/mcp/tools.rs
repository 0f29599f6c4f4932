use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{intents::Category, matches::Action};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Register,
    Login,
    Whoami,
    SetIntent,
    GetIntents,
    RemoveIntent,
    GetMatches,
    RespondMatch,
    SendMessage,
    GetMessages,
    GetNotifications,
    FindMatches,
}

impl Tool {
    pub const ALL: [Tool; 12] = [
        Tool::Register,
        Tool::Login,
        Tool::Whoami,
        Tool::SetIntent,
        Tool::GetIntents,
        Tool::RemoveIntent,
        Tool::GetMatches,
        Tool::RespondMatch,
        Tool::SendMessage,
        Tool::GetMessages,
        Tool::GetNotifications,
        Tool::FindMatches,
    ];

    pub fn name(&self) -> &'static str {
        use Tool::*;
        match self {
            Register => "social_register",
            Login => "social_login",
            Whoami => "social_whoami",
            SetIntent => "social_set_intent",
            GetIntents => "social_get_intents",
            RemoveIntent => "social_remove_intent",
            GetMatches => "social_get_matches",
            RespondMatch => "social_respond_match",
            SendMessage => "social_send_message",
            GetMessages => "social_get_messages",
            GetNotifications => "social_get_notifications",
            FindMatches => "social_find_matches",
        }
    }

    pub fn from_name(name: &str) -> Option<Tool> {
        Tool::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn description(&self) -> &'static str {
        use Tool::*;
        match self {
            Register => "Register a new profile, or update the one you registered before. Returns an API key once; keep it to stay logged in.",
            Login => "Log in to an existing profile by display name or profile id. Use this when your session was lost.",
            Whoami => "Show the profile you are currently logged in as.",
            SetIntent => "Declare what kind of connection you are looking for. Matching against other people's intents runs immediately.",
            GetIntents => "List your active intents.",
            RemoveIntent => "Retire one of your intents. It will no longer be matched; existing matches are kept.",
            GetMatches => "Get your current matches and pending introductions.",
            RespondMatch => "Accept or reject a match introduction.",
            SendMessage => "Send a message to a match. Both sides must have accepted first.",
            GetMessages => "Read the conversation for a match.",
            GetNotifications => "Get new matches, requests and messages since you last checked.",
            FindMatches => "Run matching for all of your active intents now.",
        }
    }

    pub fn input_schema(&self) -> Value {
        use Tool::*;
        let profile_id = json!({
            "type": "string",
            "description": "Your profile id. Only needed if your session was lost.",
        });
        let match_id = json!({ "type": "string", "description": "The match id" });

        let (properties, required) = match self {
            Register => (
                json!({
                    "display_name": { "type": "string", "description": "Name other people will see" },
                    "bio": { "type": "string", "description": "A short description of yourself" },
                    "location": { "type": "string", "description": "Where you are, optional" },
                    "client_id": { "type": "string", "description": "Stable id of this client; re-registering with it updates the same profile" },
                }),
                json!(["display_name", "bio"]),
            ),
            Login => (
                json!({
                    "display_name": { "type": "string", "description": "Your display name (case-insensitive)" },
                    "profile_id": { "type": "string", "description": "Your profile id" },
                }),
                json!([]),
            ),
            SetIntent => (
                json!({
                    "category": {
                        "type": "string",
                        "enum": Category::ALL.map(|c| c.as_str()),
                        "description": "Kind of connection",
                    },
                    "description": { "type": "string", "description": "What you are looking for, in your own words" },
                    "criteria": { "type": "object", "description": "Optional structured preferences" },
                    "profile_id": profile_id,
                }),
                json!(["category", "description"]),
            ),
            RemoveIntent => (
                json!({
                    "intent_id": { "type": "string", "description": "The intent id, as listed by social_get_intents" },
                    "profile_id": profile_id,
                }),
                json!(["intent_id"]),
            ),
            RespondMatch => (
                json!({
                    "match_id": match_id,
                    "action": { "type": "string", "enum": ["accept", "reject"] },
                    "profile_id": profile_id,
                }),
                json!(["match_id", "action"]),
            ),
            SendMessage => (
                json!({
                    "match_id": match_id,
                    "content": { "type": "string", "description": "Message text" },
                    "profile_id": profile_id,
                }),
                json!(["match_id", "content"]),
            ),
            GetMessages => (
                json!({ "match_id": match_id, "profile_id": profile_id }),
                json!(["match_id"]),
            ),
            Whoami | GetIntents | GetMatches | GetNotifications | FindMatches => (
                json!({ "profile_id": profile_id }),
                json!([]),
            ),
        };

        json!({ "type": "object", "properties": properties, "required": required })
    }

    pub fn definition(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "inputSchema": self.input_schema(),
        })
    }
}

pub fn catalog() -> Vec<Value> {
    Tool::ALL.iter().map(Tool::definition).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterArgs {
    pub display_name: String,
    pub bio: String,
    pub location: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginArgs {
    pub display_name: Option<String>,
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetIntentArgs {
    pub category: Category,
    pub description: String,
    pub criteria: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveIntentArgs {
    pub intent_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RespondMatchArgs {
    pub match_id: String,
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageArgs {
    pub match_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchArgs {
    pub match_id: String,
}

/// A tool invocation with its arguments already decoded.
#[derive(Debug, Clone)]
pub enum ToolCall {
    Register(RegisterArgs),
    Login(LoginArgs),
    Whoami,
    SetIntent(SetIntentArgs),
    GetIntents,
    RemoveIntent(RemoveIntentArgs),
    GetMatches,
    RespondMatch(RespondMatchArgs),
    SendMessage(SendMessageArgs),
    GetMessages(MatchArgs),
    GetNotifications,
    FindMatches,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolParseError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {source}")]
    InvalidArguments {
        tool: &'static str,
        source: serde_json::Error,
    },
}

fn args<T: DeserializeOwned>(tool: Tool, arguments: Value) -> Result<T, ToolParseError> {
    serde_json::from_value(arguments)
        .map_err(|source| ToolParseError::InvalidArguments { tool: tool.name(), source })
}

impl ToolCall {
    pub fn parse(name: &str, arguments: Value) -> Result<ToolCall, ToolParseError> {
        let tool = Tool::from_name(name)
            .ok_or_else(|| ToolParseError::UnknownTool(name.to_owned()))?;
        // a null or missing arguments object means "no arguments"
        let arguments = if arguments.is_null() { json!({}) } else { arguments };

        use Tool::*;
        Ok(match tool {
            Register => ToolCall::Register(args(tool, arguments)?),
            Login => ToolCall::Login(args(tool, arguments)?),
            Whoami => ToolCall::Whoami,
            SetIntent => ToolCall::SetIntent(args(tool, arguments)?),
            GetIntents => ToolCall::GetIntents,
            RemoveIntent => ToolCall::RemoveIntent(args(tool, arguments)?),
            GetMatches => ToolCall::GetMatches,
            RespondMatch => ToolCall::RespondMatch(args(tool, arguments)?),
            SendMessage => ToolCall::SendMessage(args(tool, arguments)?),
            GetMessages => ToolCall::GetMessages(args(tool, arguments)?),
            GetNotifications => ToolCall::GetNotifications,
            FindMatches => ToolCall::FindMatches,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<Content>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult {
            content: vec![Content::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        ToolResult {
            is_error: true,
            ..ToolResult::text(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_is_listed_once_by_name() {
        let catalog = catalog();
        assert_eq!(catalog.len(), Tool::ALL.len());
        for tool in Tool::ALL {
            assert_eq!(Tool::from_name(tool.name()), Some(tool));
            assert!(tool.name().starts_with("social_"));
        }
        assert_eq!(catalog[3]["inputSchema"]["properties"]["category"]["enum"][1], "romance");
        assert_eq!(catalog[0]["inputSchema"]["required"], json!(["display_name", "bio"]));
    }

    #[test]
    fn arguments_are_decoded_per_tool() {
        let call = ToolCall::parse("social_respond_match", json!({ "match_id": "m1", "action": "accept", "profile_id": "p" })).unwrap();
        assert!(matches!(call, ToolCall::RespondMatch(RespondMatchArgs { action: Action::Accept, .. })));

        assert!(matches!(ToolCall::parse("social_whoami", Value::Null).unwrap(), ToolCall::Whoami));

        let err = ToolCall::parse("social_set_intent", json!({ "category": "dating", "description": "x" })).unwrap_err();
        assert!(err.to_string().starts_with("Invalid arguments for social_set_intent"));

        let err = ToolCall::parse("social_teleport", json!({})).unwrap_err();
        assert!(matches!(err, ToolParseError::UnknownTool(_)));
    }

    #[test]
    fn error_flag_is_only_serialized_when_set() {
        assert_eq!(
            serde_json::to_value(ToolResult::text("ok")).unwrap(),
            json!({ "content": [{ "type": "text", "text": "ok" }] }),
        );
        assert_eq!(serde_json::to_value(ToolResult::error("no")).unwrap()["isError"], true);
    }
}
