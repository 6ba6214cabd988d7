use std::fmt;

/// STOMP protocol versions this connector can speak, oldest first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1.0", "1.1", "1.2"];

/// A STOMP frame as it travels between the connector and the broker.
///
/// `Frame` holds the command (e.g. "CONNECT", "MESSAGE"), the headers in
/// wire order and the raw body bytes. Header order matters: when a header is
/// repeated, STOMP gives the first occurrence precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command (e.g. CONNECT, SUBSCRIBE, MESSAGE)
    pub command: String,
    /// Ordered headers as (key, value) pairs
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given command and empty headers/body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header (builder style).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the frame body (builder style).
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Get the value of a header by name.
    ///
    /// Returns the first header value matching the given key (case-sensitive),
    /// or `None` if no such header exists.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true when the frame carries the given command.
    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Build the CONNECT frame opening a session.
    ///
    /// Parameters
    /// - `vhost`: value for the `host` header (virtual host on the broker).
    /// - `login` / `passcode`: credentials; empty values are still sent so
    ///   brokers with guest access behave consistently.
    /// - `heartbeat`: the client's `heart-beat` header ("cx,cy" in ms).
    pub fn connect(vhost: &str, login: &str, passcode: &str, heartbeat: &str) -> Self {
        Frame::new("CONNECT")
            .header("accept-version", SUPPORTED_VERSIONS.join(","))
            .header("host", vhost)
            .header("login", login)
            .header("passcode", passcode)
            .header("heart-beat", heartbeat)
    }

    /// Build a SUBSCRIBE frame with automatic acknowledgement.
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// Build a DISCONNECT frame asking the broker for a receipt.
    pub fn disconnect(receipt_id: &str) -> Self {
        Frame::new("DISCONNECT").header("receipt", receipt_id)
    }

    /// Human readable summary of an ERROR frame: the `message` header
    /// followed by the body when one is present.
    pub fn error_summary(&self) -> String {
        let message = self.get_header("message").unwrap_or("unknown error");
        let body = String::from_utf8_lossy(&self.body);
        let body = body.trim();
        if body.is_empty() {
            message.to_string()
        } else {
            format!("{}: {}", message, body)
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            // never print credentials when frames are logged in debug mode
            if k == "passcode" {
                writeln!(f, "{}: <redacted>", k)?;
            } else {
                writeln!(f, "{}: {}", k, v)?;
            }
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_advertises_all_versions() {
        let f = Frame::connect("/", "guest", "secret", "0,0");
        assert_eq!(f.command, "CONNECT");
        assert_eq!(f.get_header("accept-version"), Some("1.0,1.1,1.2"));
        assert_eq!(f.get_header("host"), Some("/"));
        assert_eq!(f.get_header("heart-beat"), Some("0,0"));
    }

    #[test]
    fn display_redacts_passcode() {
        let f = Frame::connect("/", "guest", "hunter2", "0,0");
        let s = format!("{}", f);
        assert!(s.contains("passcode: <redacted>"));
        assert!(!s.contains("hunter2"));
    }

    #[test]
    fn error_summary_joins_message_and_body() {
        let f = Frame::new("ERROR")
            .header("message", "Bad CONNECT")
            .set_body(b"Access refused\n".to_vec());
        assert_eq!(f.error_summary(), "Bad CONNECT: Access refused");
        assert_eq!(Frame::new("ERROR").error_summary(), "unknown error");
    }
}
