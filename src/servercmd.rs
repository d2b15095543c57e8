//! JSON command/reply envelope carried in `ServerCommand` messages.
//!
//! Two families share the envelope:
//! - [`ServerCommand`] — client→server operator commands
//!   (`{"cmd": ..., "args": [...], "kwargs": {...}}`)
//! - [`ServerReply`] — server→client replies tagged by `type`
//!
//! Parsing is tolerant: malformed JSON or a wrong message type logs a
//! warning and yields an empty sentinel value, never an error to the caller.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::message::Message;

/// A structured command sent by a client or operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    #[serde(default)]
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl ServerCommand {
    /// Build a command message from parts.
    pub fn make(cmd: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Message {
        ServerCommand {
            cmd: cmd.into(),
            args,
            kwargs,
        }
        .to_message()
    }

    pub fn make_kick(target: u8, ban: bool) -> Message {
        debug_assert!(target > 0);
        let mut kwargs = Map::new();
        if ban {
            kwargs.insert("ban".into(), Value::Bool(true));
        }
        Self::make("kick-user", vec![json!(target)], kwargs)
    }

    pub fn make_unban(entry_id: i32) -> Message {
        Self::make("remove-ban", vec![json!(entry_id)], Map::new())
    }

    pub fn make_mute(target: u8, mute: bool) -> Message {
        Self::make("mute", vec![json!(target), json!(mute)], Map::new())
    }

    pub fn make_announce(url: &str) -> Message {
        Self::make("announce-session", vec![json!(url)], Map::new())
    }

    pub fn make_unannounce(url: &str) -> Message {
        Self::make("unlist-session", vec![json!(url)], Map::new())
    }

    /// Compile-time OS tag reported by this client for auto-reset delegate
    /// selection.
    pub fn autoreset_os() -> &'static str {
        if cfg!(target_family = "wasm") {
            "wasm"
        } else if cfg!(target_os = "android") {
            "android"
        } else if cfg!(target_os = "ios") {
            "ios"
        } else if cfg!(target_os = "windows") {
            "windows"
        } else if cfg!(target_os = "macos") {
            "macos"
        } else if cfg!(target_os = "linux") {
            "linux"
        } else if cfg!(unix) {
            "unix"
        } else {
            "unknown"
        }
    }

    /// Rate an OS tag as an auto-reset delegate candidate: -1 for mobile and
    /// web clients (memory limits, fall asleep easily), 1 for desktop
    /// operating systems, 0 for unknown.
    pub fn rate_autoreset_os(os: &str) -> i32 {
        match os {
            "wasm" | "android" | "ios" => -1,
            "windows" | "macos" | "linux" | "unix" => 1,
            _ => 0,
        }
    }

    /// Serialize into an opaque `ServerCommand` message. Empty `args` and
    /// `kwargs` are omitted from the JSON.
    pub fn to_message(&self) -> Message {
        let data = serde_json::to_value(self).unwrap_or(Value::Null);
        Message::make_server_command(0, &data)
    }

    /// Parse a command out of a message. Wrong message type or malformed
    /// JSON logs a warning and returns an empty command.
    pub fn from_message(msg: &Message) -> ServerCommand {
        let Some(payload) = msg.server_command_payload() else {
            log::warn!(
                "ServerCommand::from_message: bad message type {:?}",
                msg.msg_type()
            );
            return ServerCommand::default();
        };
        match serde_json::from_slice(payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                log::warn!("ServerCommand::from_message JSON parsing error: {err}");
                ServerCommand::default()
            }
        }
    }
}

/// Reply tags recognized by clients. Anything else maps to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    Login,
    Message,
    Alert,
    Error,
    Result,
    Log,
    SessionConf,
    SizeLimitWarning,
    Status,
    Reset,
    ResetRequest,
    Catchup,
    CaughtUp,
    BanImpEx,
    OutOfSpace,
    StreamStart,
    StreamProgress,
    PasswordChange,
    InviteCreated,
    Thumbnail,
    Unknown,
}

impl ReplyType {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "login" => Self::Login,
            "msg" => Self::Message,
            "alert" => Self::Alert,
            "error" => Self::Error,
            "result" => Self::Result,
            "log" => Self::Log,
            "sessionconf" => Self::SessionConf,
            "sizelimit" => Self::SizeLimitWarning,
            "status" => Self::Status,
            "reset" => Self::Reset,
            "autoreset" => Self::ResetRequest,
            "catchup" => Self::Catchup,
            "caughtup" => Self::CaughtUp,
            "banimpex" => Self::BanImpEx,
            "outofspace" => Self::OutOfSpace,
            "sstart" => Self::StreamStart,
            "sprogress" => Self::StreamProgress,
            "passwordchange" => Self::PasswordChange,
            "invitecreated" => Self::InviteCreated,
            "thumbnail" => Self::Thumbnail,
            _ => Self::Unknown,
        }
    }
}

/// A parsed server reply: the tag, the human-readable message (if any), and
/// the full JSON object for type-specific fields.
#[derive(Debug, Clone)]
pub struct ServerReply {
    pub reply_type: ReplyType,
    pub message: String,
    pub reply: Value,
}

impl ServerReply {
    fn empty() -> Self {
        Self {
            reply_type: ReplyType::Unknown,
            message: String::new(),
            reply: Value::Null,
        }
    }

    /// Parse a reply out of a message. Wrong message type or malformed JSON
    /// logs a warning and returns an empty `Unknown` reply.
    pub fn from_message(msg: &Message) -> ServerReply {
        let Some(payload) = msg.server_command_payload() else {
            log::warn!(
                "ServerReply::from_message: bad message type {:?}",
                msg.msg_type()
            );
            return Self::empty();
        };
        match serde_json::from_slice::<Value>(payload) {
            Ok(data) => Self::from_json(data),
            Err(err) => {
                log::warn!("ServerReply::from_message JSON parsing error: {err}");
                Self::empty()
            }
        }
    }

    pub fn from_json(data: Value) -> ServerReply {
        let reply_type = data
            .get("type")
            .and_then(Value::as_str)
            .map_or(ReplyType::Unknown, ReplyType::from_tag);
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        ServerReply {
            reply_type,
            message,
            reply: data,
        }
    }

    /// Wrap a reply object into an opaque server-originated message.
    pub fn make(data: Value) -> Message {
        Message::make_server_command(0, &data)
    }

    pub fn make_error(message: &str, code: &str) -> Message {
        Self::make(json!({"type": "error", "message": message, "code": code}))
    }

    pub fn make_command_error(command: &str, message: &str) -> Message {
        Self::make(json!({"type": "error", "message": format!("{command}: {message}")}))
    }

    pub fn make_message(message: &str) -> Message {
        Self::make(json!({"type": "msg", "message": message}))
    }

    pub fn make_alert(message: &str) -> Message {
        Self::make(json!({"type": "alert", "message": message}))
    }

    pub fn make_key_message(message: &str, key: &str, params: Value) -> Message {
        let mut data = json!({"type": "msg", "message": message, "T": key});
        if params.as_object().is_some_and(|p| !p.is_empty()) {
            data["P"] = params;
        }
        Self::make(data)
    }

    pub fn make_key_alert(message: &str, key: &str, params: Value) -> Message {
        let mut data = json!({"type": "alert", "message": message, "T": key});
        if params.as_object().is_some_and(|p| !p.is_empty()) {
            data["P"] = params;
        }
        Self::make(data)
    }

    pub fn make_log(message: &str, mut data: Value) -> Message {
        data["type"] = json!("log");
        data["message"] = json!(message);
        Self::make(data)
    }

    /// Catch-up announcement: `count` messages are on the way. A key of -1
    /// is omitted (older clients don't echo keys back).
    pub fn make_catchup(count: i64, key: i32) -> Message {
        let mut data = json!({"type": "catchup", "count": count});
        if key != -1 {
            data["key"] = json!(key);
        }
        Self::make(data)
    }

    pub fn make_caught_up(key: i32) -> Message {
        Self::make(json!({"type": "caughtup", "key": key}))
    }

    pub fn make_reset(message: &str, state: &str) -> Message {
        Self::make(json!({"type": "reset", "message": message, "state": state}))
    }

    pub fn make_reset_query(max_size: usize, payload: &str) -> Message {
        Self::make(json!({
            "type": "autoreset",
            "maxSize": max_size,
            "query": true,
            "payload": payload,
        }))
    }

    pub fn make_reset_request(max_size: usize) -> Message {
        Self::make(json!({"type": "autoreset", "maxSize": max_size, "query": false}))
    }

    pub fn make_streamed_reset_request(
        max_size: usize,
        correlator: &str,
        stream: &str,
    ) -> Message {
        Self::make(json!({
            "type": "autoreset",
            "maxSize": max_size,
            "query": false,
            "correlator": correlator,
            "stream": stream,
        }))
    }

    /// Streamed reset begin marker, attributed to the resetting client.
    pub fn make_streamed_reset_start(context_id: u8, correlator: &str) -> Message {
        Message::make_server_command(
            context_id,
            &json!({"type": "sstart", "correlator": correlator}),
        )
    }

    pub fn make_streamed_reset_progress(context_id: u8, cancel: bool) -> Message {
        Message::make_server_command(context_id, &json!({"type": "sprogress", "cancel": cancel}))
    }

    pub fn make_session_conf(config: Value) -> Message {
        Self::make(json!({"type": "sessionconf", "config": config}))
    }

    pub fn make_password_change(password: &str) -> Message {
        Self::make(json!({"type": "passwordchange", "password": password}))
    }

    pub fn make_size_limit_warning(size: usize, max_size: usize) -> Message {
        Self::make(json!({"type": "sizelimit", "size": size, "maxSize": max_size}))
    }

    pub fn make_out_of_space() -> Message {
        Self::make(json!({"type": "outofspace"}))
    }

    pub fn make_status_update(size: usize) -> Message {
        Self::make(json!({"type": "status", "size": size}))
    }

    pub fn make_invite_created(secret: &str) -> Message {
        Self::make(json!({"type": "invitecreated", "secret": secret}))
    }

    pub fn make_ban_export_result(data: &str) -> Message {
        Self::make(json!({"type": "banimpex", "export": data}))
    }

    pub fn make_ban_import_result(total: i32, imported: i32) -> Message {
        Self::make(json!({"type": "banimpex", "imported": imported, "total": total}))
    }

    pub fn make_ban_impex_error(message: &str, key: &str) -> Message {
        Self::make(json!({"type": "banimpex", "error": message, "T": key}))
    }

    pub fn make_thumbnail_query(payload: &str) -> Message {
        Self::make(json!({"type": "thumbnail", "query": true, "payload": payload}))
    }

    /// Ask a client to generate a thumbnail. Zero/empty constraints are
    /// omitted from the reply.
    pub fn make_thumbnail(
        correlator: &str,
        max_width: u32,
        max_height: u32,
        quality: u32,
        format: &str,
    ) -> Message {
        let mut data = json!({"type": "thumbnail", "correlator": correlator});
        if max_width > 0 {
            data["maxWidth"] = json!(max_width);
        }
        if max_height > 0 {
            data["maxHeight"] = json!(max_height);
        }
        if quality > 0 {
            data["quality"] = json!(quality);
        }
        if !format.is_empty() {
            data["format"] = json!(format);
        }
        Self::make(data)
    }
}
