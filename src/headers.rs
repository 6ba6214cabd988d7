//! How STOMP message headers are carried into events.

use crate::client::Message;
use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HeaderMode {
    /// Headers are dropped.
    #[default]
    None,
    /// Headers are written in front of the body as `name:value` lines,
    /// followed by `delimiter`, and the result is decoded as the payload.
    Prepend { delimiter: String },
    /// Each header becomes a string field on every decoded event. With an
    /// allow list only the named headers are copied.
    Fields { allow_list: Option<Vec<String>> },
}

impl HeaderMode {
    /// Bytes handed to the codec for `message`.
    pub fn payload(&self, message: &Message) -> Vec<u8> {
        match self {
            HeaderMode::Prepend { delimiter } => prepend_headers(message, delimiter),
            _ => message.body.clone(),
        }
    }

    /// Copy headers onto `event` in `Fields` mode; a no-op otherwise.
    pub fn apply(&self, message: &Message, event: &mut Event) {
        let HeaderMode::Fields { allow_list } = self else {
            return;
        };
        for (name, value) in &message.headers {
            let allowed = allow_list
                .as_ref()
                .is_none_or(|list| list.iter().any(|n| n == name));
            if allowed {
                event.set(name, value.as_str());
            }
        }
    }
}

fn prepend_headers(message: &Message, delimiter: &str) -> Vec<u8> {
    let rendered = message
        .headers
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("\n");
    let mut out = Vec::with_capacity(rendered.len() + delimiter.len() + message.body.len());
    out.extend_from_slice(rendered.as_bytes());
    out.extend_from_slice(delimiter.as_bytes());
    out.extend_from_slice(&message.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::new("payload")
            .header("destination", "/queue/a")
            .header("priority", "4")
    }

    #[test]
    fn none_passes_body_through() {
        let mut event = Event::new();
        HeaderMode::None.apply(&message(), &mut event);
        assert_eq!(HeaderMode::None.payload(&message()), b"payload");
        assert!(!event.contains("destination"));
    }

    #[test]
    fn prepend_renders_headers_then_delimiter() {
        let mode = HeaderMode::Prepend {
            delimiter: "\n\n".to_string(),
        };
        assert_eq!(
            mode.payload(&message()),
            b"destination:/queue/a\npriority:4\n\npayload"
        );
    }

    #[test]
    fn fields_respect_allow_list() {
        let mode = HeaderMode::Fields {
            allow_list: Some(vec!["priority".to_string()]),
        };
        let mut event = Event::new();
        mode.apply(&message(), &mut event);
        assert_eq!(event.get_str("priority"), Some("4"));
        assert!(!event.contains("destination"));
    }

    #[test]
    fn fields_without_allow_list_copy_all_and_last_wins() {
        let mode = HeaderMode::Fields { allow_list: None };
        let msg = message().header("priority", "9");
        let mut event = Event::new();
        mode.apply(&msg, &mut event);
        assert_eq!(event.get_str("destination"), Some("/queue/a"));
        assert_eq!(event.get_str("priority"), Some("9"));
    }
}
