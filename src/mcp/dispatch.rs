use std::fmt::Write;

use serde_json::json;

use crate::{
    auth::{credentials, sessions, Identity, Strategy},
    chat::{self, MessageType},
    db,
    intents,
    matches::{self, machine::{self, Outcome, Step}, MatchStatus, Side},
    mcp::tools::{LoginArgs, MatchArgs, RegisterArgs, RemoveIntentArgs, RespondMatchArgs, SendMessageArgs, SetIntentArgs, ToolCall, ToolResult},
    notify::{self, NotificationKind},
    profiles::{self, NewProfile, Profile},
    AppResult, AppState,
};

const NOT_LOGGED_IN: &str = "Not logged in. Use social_login or social_register first, or pass your profile_id in the arguments.";
const NOT_A_PARTY: &str = "You are not part of this match. Use social_get_matches to see your matches.";
const MATCH_NOT_FOUND: &str = "Match not found. Use social_get_matches to see your matches.";
const CLIENT_ID_TAKEN: &str = "This client_id is already registered to another profile. Use social_login, or send that profile's API key to update it.";
const NOT_ACCEPTED: &str = "Cannot message until both parties accept the match. Use social_respond_match to accept first.";

/// Who is calling, as far as the gateway could tell.
#[derive(Debug, Clone)]
pub struct Caller<'a> {
    pub session_id: &'a str,
    pub identity: Option<Identity>,
}

impl Caller<'_> {
    fn profile_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.profile_id.as_str())
    }
}

/// Runs one tool call. Business conditions come back as error results; only
/// infrastructure failures are returned as `Err`.
pub async fn dispatch(state: &AppState, caller: &Caller<'_>, call: ToolCall) -> AppResult<ToolResult> {
    match (call, caller.profile_id()) {
        (ToolCall::Register(args), _) => register(state, caller, args).await,
        (ToolCall::Login(args), _) => login(state, caller, args).await,
        (ToolCall::Whoami, me) => whoami(state, me).await,
        (ToolCall::FindMatches, me) => find_matches(state, me).await,
        (ToolCall::SetIntent(args), Some(me)) => set_intent(state, me, args).await,
        (ToolCall::GetIntents, Some(me)) => get_intents(state, me).await,
        (ToolCall::RemoveIntent(args), Some(me)) => remove_intent(state, me, args).await,
        (ToolCall::GetMatches, Some(me)) => get_matches(state, me).await,
        (ToolCall::RespondMatch(args), Some(me)) => respond_match(state, me, args).await,
        (ToolCall::SendMessage(args), Some(me)) => send_message(state, me, args).await,
        (ToolCall::GetMessages(args), Some(me)) => get_messages(state, me, args).await,
        (ToolCall::GetNotifications, Some(me)) => get_notifications(state, me).await,
        (
            ToolCall::SetIntent(_)
            | ToolCall::GetIntents
            | ToolCall::RemoveIntent(_)
            | ToolCall::GetMatches
            | ToolCall::RespondMatch(_)
            | ToolCall::SendMessage(_)
            | ToolCall::GetMessages(_)
            | ToolCall::GetNotifications,
            None,
        ) => Ok(ToolResult::error(NOT_LOGGED_IN)),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn percent(score: f64) -> i64 {
    (score * 100.0).round() as i64
}

fn render_profile(out: &mut String, profile: &Profile) {
    let _ = writeln!(out, "Display Name: {}", profile.display_name);
    let _ = writeln!(out, "Profile ID: {}", profile.id);
    let _ = writeln!(out, "Bio: {}", profile.bio);
    let _ = writeln!(out, "Location: {}", profile.location.as_deref().unwrap_or("Not set"));
}

async fn register(state: &AppState, caller: &Caller<'_>, args: RegisterArgs) -> AppResult<ToolResult> {
    let Some(display_name) = non_empty(Some(args.display_name.as_str())) else {
        return Ok(ToolResult::error("display_name must not be empty."));
    };

    let details = NewProfile {
        client_id: "",
        display_name,
        bio: args.bio.trim(),
        location: non_empty(args.location.as_deref()),
    };

    // a bare profile id claim is not enough to take over a profile and mint it a key
    let owner = caller.identity.as_ref().filter(|identity| identity.via != Strategy::ProfileId);
    let owned = match owner {
        Some(identity) => profiles::find(&state.db_pool, &identity.profile_id).await?,
        None => None,
    };
    // an existing profile is only ever updated by the caller it is already bound to
    let existing = match (non_empty(args.client_id.as_deref()), owned) {
        (Some(client_id), Some(profile)) if profile.client_id == client_id => Some(profile.id),
        (Some(_), _) => None,
        (None, profile) => profile.map(|profile| profile.id),
    };

    let (profile_id, created) = match existing {
        Some(profile_id) => {
            profiles::update(&state.db_pool, &profile_id, details).await?;
            (profile_id, false)
        }
        None => {
            let client_id = match non_empty(args.client_id.as_deref()) {
                Some(client_id) => client_id.to_owned(),
                None => format!("mcp_{}", db::new_id()),
            };
            let Some(profile_id) = profiles::create(&state.db_pool, NewProfile { client_id: &client_id, ..details }).await? else {
                return Ok(ToolResult::error(CLIENT_ID_TAKEN));
            };
            (profile_id, true)
        }
    };

    let api_key = credentials::issue(&state.db_pool, state.auth.pepper(), &profile_id, "mcp").await?;
    sessions::bind(&state.db_pool, caller.session_id, &profile_id).await?;

    let headline = if created { "Profile registered!" } else { "Profile updated!" };
    Ok(ToolResult::text(format!(
        "{headline}\n\n\
         Profile ID: {profile_id}\n\
         Display Name: {display_name}\n\
         API Key: {api_key}\n\n\
         This key is shown only once. Send it as the x-mcp-api-key header (or Authorization: Bearer) to stay logged in.\n\
         Your session is now authenticated.\n\n\
         Tip: use social_set_intent to say what you're looking for."
    )))
}

async fn login(state: &AppState, caller: &Caller<'_>, args: LoginArgs) -> AppResult<ToolResult> {
    let profile = match (non_empty(args.profile_id.as_deref()), non_empty(args.display_name.as_deref())) {
        (Some(profile_id), _) => profiles::find_active(&state.db_pool, profile_id).await?,
        (None, Some(display_name)) => profiles::find_by_display_name(&state.db_pool, display_name).await?,
        (None, None) => return Ok(ToolResult::error("Provide your display_name or profile_id to log in.")),
    };
    let Some(profile) = profile else {
        return Ok(ToolResult::error(
            "Profile not found. Check your display name or profile id, or use social_register to create a new profile.",
        ));
    };

    sessions::bind(&state.db_pool, caller.session_id, &profile.id).await?;
    profiles::touch(&state.db_pool, &profile.id).await?;
    tracing::info!(session = caller.session_id, profile = %profile.id, "logged in");

    let mut text = format!("Logged in! Welcome back, {}.\n\n", profile.display_name);
    render_profile(&mut text, &profile);
    text.push_str("\nYou can now use all social-mcp tools.");
    Ok(ToolResult::text(text))
}

async fn whoami(state: &AppState, me: Option<&str>) -> AppResult<ToolResult> {
    let Some(me) = me else {
        return Ok(ToolResult::text(
            "Not logged in.\n\nUse social_login with your display_name to log in, or social_register to create a new profile.",
        ));
    };
    let Some(profile) = profiles::find(&state.db_pool, me).await? else {
        return Ok(ToolResult::error("Profile not found. Your session may be invalid; use social_login again."));
    };

    let mut text = String::from("You are logged in as:\n\n");
    render_profile(&mut text, &profile);
    let _ = write!(text, "Member since: {}", db::format_date(profile.created_at));
    Ok(ToolResult::text(text))
}

fn render_created(out: &mut String, created: &[matches::engine::Created]) {
    for m in created {
        let _ = writeln!(
            out,
            "- {} ({}% match): \"{}\"\n  {}\n  Match ID: {}",
            m.counterpart_name, percent(m.found.score), m.counterpart_intent, m.found.reason, m.found.id,
        );
    }
}

async fn set_intent(state: &AppState, me: &str, args: SetIntentArgs) -> AppResult<ToolResult> {
    if args.description.trim().is_empty() {
        return Ok(ToolResult::error("description must not be empty."));
    }

    let intent = intents::create(&state.db_pool, me, args.category, &args.description, args.criteria.as_ref()).await?;
    let created = state.engine.run_for_intent(&state.db_pool, &state.hub, &intent.id).await?;

    let mut text = format!(
        "Intent set!\n\nCategory: {}\nDescription: {}\nIntent ID: {}\n\n",
        intent.category, intent.description, intent.id,
    );
    if created.is_empty() {
        text.push_str("No matches yet. We'll notify you when someone compatible shows up; check social_get_notifications.");
    } else {
        let _ = writeln!(text, "Found {} match(es):", created.len());
        render_created(&mut text, &created);
        text.push_str("\nUse social_respond_match to accept or reject.");
    }
    Ok(ToolResult::text(text))
}

async fn get_intents(state: &AppState, me: &str) -> AppResult<ToolResult> {
    let list = intents::active_for(&state.db_pool, me).await?;
    if list.is_empty() {
        return Ok(ToolResult::text("No active intents. Use social_set_intent to create one."));
    }

    let mut text = String::from("Your intents:\n\n");
    for intent in list {
        let _ = writeln!(text, "- [{}] {}\n  ID: {}", intent.category, intent.description, intent.id);
    }
    Ok(ToolResult::text(text))
}

async fn remove_intent(state: &AppState, me: &str, args: RemoveIntentArgs) -> AppResult<ToolResult> {
    if !intents::deactivate(&state.db_pool, me, args.intent_id.trim()).await? {
        return Ok(ToolResult::error(
            "Intent not found among your active intents. Use social_get_intents to see them.",
        ));
    }
    Ok(ToolResult::text(format!(
        "Intent removed. It will no longer be matched.\n\nIntent ID: {}",
        args.intent_id.trim(),
    )))
}

async fn get_matches(state: &AppState, me: &str) -> AppResult<ToolResult> {
    let listings = matches::visible_for(&state.db_pool, me).await?;
    if listings.is_empty() {
        return Ok(ToolResult::text("No matches yet. Keep your intents active!"));
    }

    let mut text = String::from("Matches:\n\n");
    for listing in listings {
        let m = &listing.inner;
        let Some(side) = m.side_of(me) else { continue };
        let (name, bio) = match side {
            Side::A => (&listing.b_display_name, &listing.b_bio),
            Side::B => (&listing.a_display_name, &listing.a_bio),
        };
        let requires_my_action = matches!(
            (m.status, side),
            (MatchStatus::PendingA, Side::A) | (MatchStatus::PendingB, Side::B)
        );

        let _ = writeln!(text, "- {name} ({}% match)", percent(m.score));
        // the counterpart's bio stays hidden until both sides have accepted
        if m.status == MatchStatus::Accepted && !bio.is_empty() {
            let _ = writeln!(text, "  Bio: {bio}");
        }
        if !m.reason.is_empty() {
            let _ = writeln!(text, "  Why: {}", m.reason);
        }
        let _ = writeln!(text, "  Status: {} | ID: {}", m.status, m.id);
        if requires_my_action {
            let _ = writeln!(text, "  Your move: social_respond_match match_id=\"{}\" action=\"accept\" or \"reject\"", m.id);
        } else if m.status == MatchStatus::Accepted {
            let _ = writeln!(text, "  Chat: social_send_message match_id=\"{}\"", m.id);
        }
    }
    Ok(ToolResult::text(text))
}

async fn respond_match(state: &AppState, me: &str, args: RespondMatchArgs) -> AppResult<ToolResult> {
    let outcome = machine::respond(&state.db_pool, &state.hub, &args.match_id, me, args.action).await?;
    Ok(match outcome {
        Outcome::NotFound => ToolResult::error(MATCH_NOT_FOUND),
        Outcome::NotParty => ToolResult::error(NOT_A_PARTY),
        Outcome::Moved { to: MatchStatus::PendingB, .. } => ToolResult::text(
            "Accepted! Waiting for the other person to accept. You'll get a notification when they do.",
        ),
        Outcome::Moved { to: MatchStatus::Accepted, found, .. } => ToolResult::text(format!(
            "It's a match! You're now connected.\n\nStart chatting: social_send_message match_id=\"{}\"",
            found.id,
        )),
        Outcome::Moved { to, .. } => ToolResult::text(format!("Match {to}.")),
        Outcome::Unchanged { step: Step::WaitingOn(_), found } => ToolResult::text(format!(
            "Waiting on the other person to respond first. Nothing changed; the match is still {}.",
            found.status,
        )),
        Outcome::Unchanged { step: Step::Settled(status), .. } => ToolResult::text(format!(
            "This match is already {status}. Nothing changed.",
        )),
        Outcome::Unchanged { found, .. } => ToolResult::text(format!("Nothing changed; the match is {}.", found.status)),
    })
}

async fn send_message(state: &AppState, me: &str, args: SendMessageArgs) -> AppResult<ToolResult> {
    let content = args.content.trim();
    if content.is_empty() {
        return Ok(ToolResult::error("content must not be empty."));
    }

    let Some(m) = matches::find(&state.db_pool, &args.match_id).await? else {
        return Ok(ToolResult::error(MATCH_NOT_FOUND));
    };
    let Some(side) = m.side_of(me) else {
        return Ok(ToolResult::error(NOT_A_PARTY));
    };
    if m.status != MatchStatus::Accepted {
        return Ok(ToolResult::error(NOT_ACCEPTED));
    }
    let Some(message_id) = chat::send(&state.db_pool, &m.id, me, content).await? else {
        return Ok(ToolResult::error(NOT_ACCEPTED));
    };

    notify::publish(&state.db_pool, &state.hub, m.profile(side.other()), NotificationKind::NewMessage, json!({
        "match_id": m.id,
        "message_id": message_id,
        "from_profile_id": me,
        "preview": content.chars().take(80).collect::<String>(),
    })).await?;

    Ok(ToolResult::text(
        "Message sent!\n\nThe recipient will see it in social_get_notifications or social_get_messages.",
    ))
}

async fn get_messages(state: &AppState, me: &str, args: MatchArgs) -> AppResult<ToolResult> {
    let Some(m) = matches::find(&state.db_pool, &args.match_id).await? else {
        return Ok(ToolResult::error(MATCH_NOT_FOUND));
    };
    if m.side_of(me).is_none() {
        return Ok(ToolResult::error(NOT_A_PARTY));
    }

    let messages = chat::list(&state.db_pool, &m.id).await?;
    chat::mark_read(&state.db_pool, &m.id, me).await?;
    if messages.is_empty() {
        return Ok(ToolResult::text("No messages yet. Start the conversation!"));
    }

    let mut text = String::from("Chat:\n\n");
    for message in messages {
        match message.message_type {
            MessageType::Intro | MessageType::System => {
                let _ = writeln!(text, "* {}", message.content);
            }
            MessageType::Text => {
                let who: &str = if message.sender_profile_id == me { "You" } else { &message.sender_name };
                let _ = writeln!(text, "{who}: {}", message.content);
            }
        }
    }
    Ok(ToolResult::text(text))
}

async fn get_notifications(state: &AppState, me: &str) -> AppResult<ToolResult> {
    let fresh = notify::take_undelivered(&state.db_pool, me).await?;
    let awaiting = matches::awaiting(&state.db_pool, me).await?;
    if fresh.is_empty() && awaiting.is_empty() {
        return Ok(ToolResult::text("No new notifications. All caught up!"));
    }

    let mut text = String::from("What's new:\n\n");
    for notification in &fresh {
        let payload = notification.payload();
        let match_id = payload["match_id"].as_str().unwrap_or("?");
        let line = match notification.notification_type {
            NotificationKind::NewMatch => format!(
                "New match with {} ({}%): \"{}\" (match {match_id})",
                payload["with"].as_str().unwrap_or("someone"),
                percent(payload["score"].as_f64().unwrap_or_default()),
                payload["their_intent"].as_str().unwrap_or_default(),
            ),
            NotificationKind::MatchRequest => format!("Someone accepted a match with you and is waiting on your answer (match {match_id})"),
            NotificationKind::MatchAccepted => format!("Match accepted by both sides, you can chat now (match {match_id})"),
            NotificationKind::NewMessage => format!(
                "New message: \"{}\" (match {match_id})",
                payload["preview"].as_str().unwrap_or_default(),
            ),
        };
        let _ = writeln!(text, "- {line}");
    }

    if !awaiting.is_empty() {
        let _ = writeln!(text, "\nWaiting on your response ({}):", awaiting.len());
        for m in &awaiting {
            let _ = writeln!(
                text,
                "- {}% match: {}\n  -> social_respond_match match_id=\"{}\" action=\"accept\"",
                percent(m.score), m.reason, m.id,
            );
        }
    }
    Ok(ToolResult::text(text))
}

async fn find_matches(state: &AppState, me: Option<&str>) -> AppResult<ToolResult> {
    let created = match me {
        Some(me) => {
            if intents::active_for(&state.db_pool, me).await?.is_empty() {
                return Ok(ToolResult::text("You have no active intents. Use social_set_intent first."));
            }
            state.engine.run_for_profile(&state.db_pool, &state.hub, me).await?
        }
        None if state.config.global_find_matches => state.engine.run_global(&state.db_pool, &state.hub).await?,
        None => return Ok(ToolResult::error(NOT_LOGGED_IN)),
    };

    if created.is_empty() {
        return Ok(ToolResult::text("No new matches found right now. Check back later!"));
    }
    let mut text = format!("Found {} new match(es):\n\n", created.len());
    render_created(&mut text, &created);
    text.push_str("\nUse social_get_matches to review them.");
    Ok(ToolResult::text(text))
}
