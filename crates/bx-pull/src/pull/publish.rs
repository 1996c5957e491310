//! Outbound publish bodies.
//!
//! A chat message is published to the channel named after the chat id,
//! using the same `module_id` / `command` / `params` body that peers
//! receive through the dispatcher.

use bx_pull_proto::{MessageBody, MOBILE_REVISION};
use chrono::{DateTime, Local};
use serde_json::{json, Value};

use crate::settings::ClientSettings;

/// Command of a published chat message.
pub const NEW_MESSAGE_COMMAND: &str = "newMessage";

/// A body ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    /// Target channel ids.
    pub channels: Vec<String>,
    /// Routed body.
    pub body: MessageBody,
    /// Server metadata sent beside the body.
    pub extra: Option<Value>,
}

/// Builds publications on behalf of one user.
#[derive(Debug, Clone)]
pub struct Composer {
    chat_module: String,
    user_id: u64,
    author: String,
    site_id: String,
    hostname: String,
}

impl Composer {
    /// Create a composer for `user_id`.
    #[must_use]
    pub fn new(settings: &ClientSettings, user_id: u64) -> Self {
        Self {
            chat_module: settings.chat_module.clone(),
            user_id,
            author: settings.author_name().to_string(),
            site_id: settings.site_id.clone(),
            hostname: settings.hostname.clone(),
        }
    }

    /// A chat message to `chat_id`, stamped with `now`.
    #[must_use]
    pub fn chat_message(&self, chat_id: u64, text: &str, revision: u32, now: DateTime<Local>) -> Publication {
        let props = json!({
            "touch": now.format("%d.%m.%y %H:%M:%S").to_string(),
            "author_name": self.author,
            "title": "",
            "importance": "normal",
        });

        let group = json!({
            "id": chat_id.to_string(),
            "touch": now.format("%H:%M").to_string(),
            "author_name": self.author,
            "title": "",
            "importance": "normal",
            "isActive": false,
            "members": [],
            "managersCount": 0,
            "customersCount": 0,
            "meta": { "pinned": "false" },
            "notifications": 0,
            "type": "messageGroup",
            "author": self.user_id.to_string(),
            "date": now.to_rfc3339(),
            "props": props.to_string(),
            "state": null,
            "site": self.site_id,
        });

        let unix = now.timestamp_millis() as f64 / 1000.0;

        Publication {
            channels: vec![chat_id.to_string()],
            body: MessageBody::new(
                self.chat_module.clone(),
                NEW_MESSAGE_COMMAND,
                json!({ "author": self.author, "message": text, "group": group }),
            ),
            extra: Some(json!({
                "server_time": now.to_rfc3339(),
                "server_time_unix": unix,
                "server_name": self.hostname,
                "revision_web": revision,
                "revision_mobile": MOBILE_REVISION,
            })),
        }
    }

    /// A typing indicator for `chat_id`.
    #[must_use]
    pub fn typing(chat_id: u64, typing: bool) -> Publication {
        Publication {
            channels: vec![chat_id.to_string()],
            body: MessageBody::new("im", "typing", json!({ "chat_id": chat_id, "typing": typing })),
            extra: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn composer() -> Composer {
        let settings = ClientSettings {
            display_name: Some("Alice".to_string()),
            ..ClientSettings::default()
        };
        Composer::new(&settings, 7)
    }

    #[test]
    fn test_chat_message_shape() {
        let now = Local.with_ymd_and_hms(2025, 3, 4, 9, 5, 0).unwrap();
        let publication = composer().chat_message(42, "hello", 19, now);

        assert_eq!(publication.channels, vec!["42".to_string()]);
        assert_eq!(publication.body.module_id, "uad.shop.chat");
        assert_eq!(publication.body.command, "newMessage");

        let params = &publication.body.params;
        assert_eq!(params["message"], "hello");
        assert_eq!(params["author"], "Alice");
        assert_eq!(params["group"]["id"], "42");
        assert_eq!(params["group"]["touch"], "09:05");
        assert_eq!(params["group"]["author"], "7");
        assert_eq!(params["group"]["site"], "ap");
        assert!(params["group"]["state"].is_null());

        let props: Value = serde_json::from_str(params["group"]["props"].as_str().unwrap()).unwrap();
        assert_eq!(props["touch"], "04.03.25 09:05:00");

        let extra = publication.extra.unwrap();
        assert_eq!(extra["revision_web"], 19);
        assert_eq!(extra["revision_mobile"], 3);
        assert_eq!(extra["server_name"], "www.ugavtopart.ru");
    }

    #[test]
    fn test_unknown_author() {
        let composer = Composer::new(&ClientSettings::default(), 7);
        let publication = composer.chat_message(1, "x", 19, Local::now());
        assert_eq!(publication.body.params["author"], "Unknown");
    }

    #[test]
    fn test_typing() {
        let publication = Composer::typing(42, true);
        assert_eq!(publication.channels, vec!["42".to_string()]);
        assert_eq!(publication.body.event_type(), "im.typing");
        assert_eq!(publication.body.params["chat_id"], 42);
        assert_eq!(publication.body.params["typing"], true);
        assert!(publication.extra.is_none());
    }
}
