use std::io::Write;

use stomp_input::{ConfigError, StompInput, StompSettings};

#[test]
fn loads_settings_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
host = "mq.internal"
port = 61614
user = "reader"
password = "secret"
destination = "/topic/logstash"
ssl = true
ssl_certificate_validation = false
reconnect_interval = 10
codec = "line"
tags = ["stomp"]

[add_field]
source = "mq"
"#
    )
    .unwrap();

    let s = StompSettings::from_file(file.path()).expect("load");
    s.validate().expect("valid");
    assert_eq!(s.host, "mq.internal");
    assert_eq!(s.port, 61614);
    assert_eq!(s.password.expose(), "secret");
    assert_eq!(s.add_field.get("source").map(String::as_str), Some("mq"));

    let d = s.descriptor();
    assert_eq!(d.url(), "stomp+ssl://mq.internal:61614");
    assert!(!d.tls.verify);
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    match StompSettings::from_file(&path) {
        Err(ConfigError::Read { path: p, .. }) => assert_eq!(p, path),
        other => panic!("expected read error, got {:?}", other),
    }
}

#[test]
fn invalid_settings_are_rejected_before_registration() {
    let s = StompSettings::from_toml_str("host = \"broker\"").expect("parse");
    let result: Result<StompInput, _> = StompInput::new(s);
    assert!(matches!(result, Err(ConfigError::Missing("destination"))));
}

#[test]
fn unreadable_ca_file_fails_registration() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = StompSettings::for_destination("/queue/a");
    s.ssl = true;
    s.cacert = Some(dir.path().join("missing-ca.pem"));

    let mut input: StompInput = StompInput::new(s).expect("settings");
    assert!(matches!(input.register(), Err(ConfigError::Tls(_))));
}

#[test]
fn empty_pem_file_has_no_certificates() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut s = StompSettings::for_destination("/queue/a");
    s.ssl = true;
    s.cacert = Some(file.path().to_path_buf());

    let mut input: StompInput = StompInput::new(s).expect("settings");
    match input.register() {
        Err(ConfigError::Tls(e)) => assert!(e.to_string().contains("no certificates")),
        other => panic!("expected tls error, got {:?}", other),
    }
}
