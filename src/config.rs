//! Connector settings.
//!
//! `StompSettings` mirrors the options of the connector one to one and can
//! be deserialized from TOML. Validation happens once, before any client is
//! built; after that the settings are only read.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::CodecKind;
use crate::headers::HeaderMode;
use crate::manager::RetryPolicy;
use crate::transport::{ConnectionDescriptor, Credentials, TlsError, TlsSettings};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 61613;
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 30;

/// Configuration problems. All of them are fatal and reported before any
/// connection attempt.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// A string that never shows up in `Debug` or `Display` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The actual value. Only the CONNECT frame should need it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// How message headers reach the emitted events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderModeKind {
    /// Headers are ignored.
    #[default]
    None,
    /// Headers are rendered in front of the payload before decoding.
    Prepend,
    /// Headers become event fields.
    Fields,
}

/// All connector options with their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StompSettings {
    /// Address of the STOMP server.
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    /// Destination to read events from, e.g. `/topic/logstash`.
    pub destination: String,
    pub vhost: Option<String>,

    /// Reconnect after failures and lost connections.
    pub reconnect: bool,
    /// Seconds between reconnect attempts.
    pub reconnect_interval: u64,

    pub ssl: bool,
    pub ssl_certificate_validation: bool,
    pub cacert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,

    pub header_mode: HeaderModeKind,
    /// Separator between rendered headers and the body in `prepend` mode.
    pub header_delimiter: String,
    /// Headers copied into events in `fields` mode; all when unset.
    pub header_allow_list: Option<Vec<String>>,

    pub codec: CodecKind,
    /// Client heart-beat header ("cx,cy" in ms).
    pub heartbeat: String,
    pub debug: bool,

    /// Identifier stamped on every event as `@metadata.id`.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub tags: Vec<String>,
    pub add_field: BTreeMap<String, String>,
}

impl Default for StompSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: Secret::default(),
            destination: String::new(),
            vhost: None,
            reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL_SECS,
            ssl: false,
            ssl_certificate_validation: true,
            cacert: None,
            client_cert: None,
            client_key: None,
            header_mode: HeaderModeKind::None,
            header_delimiter: "\n".to_string(),
            header_allow_list: None,
            codec: CodecKind::Plain,
            heartbeat: "0,0".to_string(),
            debug: false,
            id: "stomp".to_string(),
            event_type: None,
            tags: Vec::new(),
            add_field: BTreeMap::new(),
        }
    }
}

impl StompSettings {
    /// Settings for `destination` with every other option at its default.
    pub fn for_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Self::default()
        }
    }

    /// Parse settings from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Read and parse a TOML settings file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the settings for combinations that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing("host"));
        }
        if self.destination.trim().is_empty() {
            return Err(ConfigError::Missing("destination"));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                field: "port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(ConfigError::Invalid {
                field: "client_cert",
                reason: "client_cert and client_key must be set together".to_string(),
            });
        }
        if !self.ssl && (self.cacert.is_some() || self.client_cert.is_some()) {
            return Err(ConfigError::Invalid {
                field: "ssl",
                reason: "certificate options require ssl = true".to_string(),
            });
        }
        if let Some(list) = &self.header_allow_list {
            if self.header_mode != HeaderModeKind::Fields {
                return Err(ConfigError::Invalid {
                    field: "header_allow_list",
                    reason: "only valid with header_mode = \"fields\"".to_string(),
                });
            }
            if list.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "header_allow_list",
                    reason: "must name at least one header".to_string(),
                });
            }
        }
        if self.heartbeat.split(',').count() != 2
            || self
                .heartbeat
                .split(',')
                .any(|part| part.trim().parse::<u64>().is_err())
        {
            return Err(ConfigError::Invalid {
                field: "heartbeat",
                reason: format!("expected \"cx,cy\" in milliseconds, got {:?}", self.heartbeat),
            });
        }
        if self.id.trim().is_empty() {
            return Err(ConfigError::Missing("id"));
        }
        Ok(())
    }

    /// The immutable connection parameters derived from these settings.
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            credentials: Credentials {
                login: self.user.clone(),
                passcode: self.password.clone(),
            },
            tls: TlsSettings {
                enabled: self.ssl,
                verify: self.ssl_certificate_validation,
                ca_file: self.cacert.clone(),
                client_cert: self.client_cert.clone(),
                client_key: self.client_key.clone(),
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.reconnect,
            interval: Duration::from_secs(self.reconnect_interval),
        }
    }

    pub fn header_mode(&self) -> HeaderMode {
        match self.header_mode {
            HeaderModeKind::None => HeaderMode::None,
            HeaderModeKind::Prepend => HeaderMode::Prepend {
                delimiter: self.header_delimiter.clone(),
            },
            HeaderModeKind::Fields => HeaderMode::Fields {
                allow_list: self.header_allow_list.clone(),
            },
        }
    }
}
