//! Minimal OneBot v11 frame handling.
//!
//! The dispatcher only reads the handful of fields it routes on; everything
//! else in a frame is preserved verbatim for forwarding. Frames are UTF-8
//! JSON objects.

use serde_json::{json, Value};

/// Coarse classification of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// `post_type = "message"` — a chat message event.
    MessageEvent,
    /// Has an `action` field — an API call from a frontend.
    ApiCall,
    /// Has `status` + `retcode` — a response to a forwarded API call.
    ApiResponse,
    /// `post_type = "meta_event"` — lifecycle / heartbeat.
    MetaEvent,
    /// Anything else (notices, requests, unknown shapes).
    Other,
}

/// Classify a parsed frame without consuming it.
pub fn classify(frame: &Value) -> FrameClass {
    let Some(obj) = frame.as_object() else {
        return FrameClass::Other;
    };

    match obj.get("post_type").and_then(Value::as_str) {
        Some("message") => return FrameClass::MessageEvent,
        Some("meta_event") => return FrameClass::MetaEvent,
        Some(_) => return FrameClass::Other,
        None => {}
    }

    if obj.get("action").and_then(Value::as_str).is_some() {
        return FrameClass::ApiCall;
    }
    if obj.contains_key("status") && obj.contains_key("retcode") {
        return FrameClass::ApiResponse;
    }
    FrameClass::Other
}

/// The routed view of a message event. `raw` keeps the full frame for
/// forwarding; the named fields are the ones resolution consumes.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub user_id: i64,
    pub group_id: Option<i64>,
    pub message_type: String,
    pub self_id: i64,
    pub nickname: String,
    pub text: String,
    pub raw: Value,
}

impl MessageEvent {
    /// Extract the routed fields from a message-event frame.
    ///
    /// Accepts `raw_message` or a string-typed `message`
    /// (`message_post_format = "string"`), preferring `raw_message`.
    pub fn from_value(raw: Value) -> Result<Self, String> {
        let obj = raw.as_object().ok_or("message event is not an object")?;

        let user_id = obj
            .get("user_id")
            .and_then(Value::as_i64)
            .ok_or("message event missing user_id")?;
        let group_id = obj.get("group_id").and_then(Value::as_i64);
        let message_type = obj
            .get("message_type")
            .and_then(Value::as_str)
            .unwrap_or("private")
            .to_string();
        let self_id = obj.get("self_id").and_then(Value::as_i64).unwrap_or(0);
        let nickname = obj
            .get("sender")
            .and_then(|s| s.get("nickname"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let text = match obj.get("raw_message").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => obj
                .get("message")
                .and_then(Value::as_str)
                .ok_or("message event carries no textual message")?
                .to_string(),
        };

        Ok(Self {
            user_id,
            group_id,
            message_type,
            self_id,
            nickname,
            text,
            raw,
        })
    }

    /// Build a synthetic message event for dry-run resolution, shaped like
    /// a real OneBot v11 frame so a resulting `Forward` payload is valid.
    pub fn synthetic(text: &str, user_id: i64, group_id: Option<i64>) -> Self {
        let message_type = if group_id.is_some() { "group" } else { "private" };
        let mut raw = json!({
            "time": 0,
            "self_id": 0,
            "post_type": "message",
            "message_type": message_type,
            "sub_type": "normal",
            "message_id": 0,
            "user_id": user_id,
            "message": text,
            "raw_message": text,
            "font": 0,
            "sender": { "user_id": user_id, "nickname": "" },
        });
        if let Some(gid) = group_id {
            raw["group_id"] = json!(gid);
        }
        Self {
            user_id,
            group_id,
            message_type: message_type.to_string(),
            self_id: 0,
            nickname: String::new(),
            text: text.to_string(),
            raw,
        }
    }

    /// Clone the raw frame with its text replaced (both `raw_message` and
    /// `message` when present), for prefix-stripped forwarding.
    pub fn with_text(&self, text: &str) -> Value {
        let mut frame = self.raw.clone();
        set_message_text(&mut frame, text);
        frame
    }
}

/// Rewrite the textual fields of a message-event frame in place.
pub fn set_message_text(frame: &mut Value, text: &str) {
    let Some(obj) = frame.as_object_mut() else {
        return;
    };
    let mut wrote = false;
    if obj.contains_key("raw_message") {
        obj.insert("raw_message".to_string(), Value::String(text.to_string()));
        wrote = true;
    }
    if obj.contains_key("message") {
        obj.insert("message".to_string(), Value::String(text.to_string()));
        wrote = true;
    }
    if !wrote {
        obj.insert("raw_message".to_string(), Value::String(text.to_string()));
    }
}

/// The echo id of an API call or response, if any.
///
/// OneBot allows any JSON value; we keep strings as-is and render numbers so
/// the correlation key is always a string.
pub fn echo_of(frame: &Value) -> Option<String> {
    match frame.get("echo") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Set the echo id on an API-call frame.
pub fn set_echo(frame: &mut Value, echo: &str) {
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("echo".to_string(), Value::String(echo.to_string()));
    }
}

/// Build the API call that replies to `original` with `text`.
///
/// Group messages get `send_group_msg`, everything else `send_private_msg`.
/// The echo marks the frame as dispatcher-synthesized.
pub fn reply_to(original: &MessageEvent, text: &str) -> Value {
    let message_id = original
        .raw
        .get("message_id")
        .cloned()
        .unwrap_or(Value::String(String::new()));
    let echo = format!("reply_{}", render_id(&message_id));

    if original.message_type == "group" {
        json!({
            "action": "send_group_msg",
            "params": {
                "group_id": original.group_id,
                "message": text,
            },
            "echo": echo,
        })
    } else {
        json!({
            "action": "send_private_msg",
            "params": {
                "user_id": original.user_id,
                "message": text,
            },
            "echo": echo,
        })
    }
}

/// The lifecycle-connect meta event sent after an upstream dial succeeds.
/// Downstream OneBot apps ignore clients that never announce themselves.
pub fn lifecycle_connect(self_id: i64, time: i64) -> Value {
    json!({
        "time": time,
        "self_id": self_id,
        "post_type": "meta_event",
        "meta_event_type": "lifecycle",
        "sub_type": "connect",
    })
}

fn render_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
