use clap::Parser;
use std::path::PathBuf;

use stomp_input::config::HeaderModeKind;
use stomp_input::{CodecKind, ConfigError, Secret, StompSettings};

#[derive(Parser)]
#[command(name = "stomp-input")]
#[command(version)]
#[command(about = "Read events from a STOMP destination and print them as JSON lines")]
pub struct Cli {
    /// TOML file with connector settings; flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// STOMP server host
    #[arg(long)]
    pub host: Option<String>,

    /// STOMP server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Login username
    #[arg(short, long)]
    pub user: Option<String>,

    /// Passcode (prefer STOMP_PASSWORD or the config file)
    #[arg(long, env = "STOMP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Destination to subscribe to, e.g. /topic/logstash
    #[arg(short, long)]
    pub destination: Option<String>,

    /// Virtual host sent in the CONNECT frame
    #[arg(long)]
    pub vhost: Option<String>,

    /// Retry failed connects (true) or give up after the first (false)
    #[arg(long, value_name = "BOOL", action = clap::ArgAction::Set)]
    pub reconnect: Option<bool>,

    /// Seconds between reconnect attempts
    #[arg(long)]
    pub reconnect_interval: Option<u64>,

    /// Connect over TLS
    #[arg(long)]
    pub ssl: bool,

    /// Accept any server certificate
    #[arg(long)]
    pub insecure: bool,

    /// CA bundle (PEM) used to verify the server
    #[arg(long)]
    pub cacert: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long)]
    pub client_cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long)]
    pub client_key: Option<PathBuf>,

    /// How message headers reach events: none, prepend or fields
    #[arg(long, value_parser = parse_header_mode)]
    pub header_mode: Option<HeaderModeKind>,

    /// Separator between headers and body in prepend mode
    #[arg(long)]
    pub header_delimiter: Option<String>,

    /// Header copied into events in fields mode (repeatable)
    #[arg(long = "header")]
    pub header_allow_list: Vec<String>,

    /// Payload codec: plain, json or line
    #[arg(long)]
    pub codec: Option<CodecKind>,

    /// Heartbeat settings (client-send,client-receive in ms)
    #[arg(long)]
    pub heartbeat: Option<String>,

    /// Tag added to every event (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Value of the `type` field
    #[arg(long = "type")]
    pub event_type: Option<String>,

    /// Log frames and connect errors in detail
    #[arg(long)]
    pub debug: bool,
}

fn parse_header_mode(s: &str) -> Result<HeaderModeKind, String> {
    match s {
        "none" => Ok(HeaderModeKind::None),
        "prepend" => Ok(HeaderModeKind::Prepend),
        "fields" => Ok(HeaderModeKind::Fields),
        other => Err(format!("unknown header mode '{}'", other)),
    }
}

impl Cli {
    /// Settings from the config file (or defaults) with flags applied.
    pub fn settings(&self) -> Result<StompSettings, ConfigError> {
        let mut s = match &self.config {
            Some(path) => StompSettings::from_file(path)?,
            None => StompSettings::default(),
        };

        if let Some(v) = &self.host {
            s.host = v.clone();
        }
        if let Some(v) = self.port {
            s.port = v;
        }
        if let Some(v) = &self.user {
            s.user = v.clone();
        }
        if let Some(v) = &self.password {
            s.password = Secret::new(v.clone());
        }
        if let Some(v) = &self.destination {
            s.destination = v.clone();
        }
        if self.vhost.is_some() {
            s.vhost = self.vhost.clone();
        }
        if let Some(v) = self.reconnect {
            s.reconnect = v;
        }
        if let Some(v) = self.reconnect_interval {
            s.reconnect_interval = v;
        }
        if self.ssl {
            s.ssl = true;
        }
        if self.insecure {
            s.ssl_certificate_validation = false;
        }
        if self.cacert.is_some() {
            s.cacert = self.cacert.clone();
        }
        if self.client_cert.is_some() {
            s.client_cert = self.client_cert.clone();
        }
        if self.client_key.is_some() {
            s.client_key = self.client_key.clone();
        }
        if let Some(v) = self.header_mode {
            s.header_mode = v;
        }
        if let Some(v) = &self.header_delimiter {
            s.header_delimiter = v.clone();
        }
        if !self.header_allow_list.is_empty() {
            s.header_allow_list = Some(self.header_allow_list.clone());
        }
        if let Some(v) = self.codec {
            s.codec = v;
        }
        if let Some(v) = &self.heartbeat {
            s.heartbeat = v.clone();
        }
        s.tags.extend(self.tags.iter().cloned());
        if self.event_type.is_some() {
            s.event_type = self.event_type.clone();
        }
        if self.debug {
            s.debug = true;
        }
        Ok(s)
    }
}
