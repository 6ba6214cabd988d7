//! StompClient against a scripted in-process broker.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stomp_input::client::MessageHandler;
use stomp_input::{
    BrokerClient, ConnectError, ConnectionDescriptor, Credentials, Secret, StompClient,
    StompInput, StompSettings, TlsSettings,
};
use tokio::sync::{Notify, mpsc};

/// Bind a listener on an ephemeral port.
fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn descriptor(port: u16) -> ConnectionDescriptor {
    ConnectionDescriptor {
        host: "127.0.0.1".to_string(),
        port,
        vhost: Some("/".to_string()),
        credentials: Credentials {
            login: "guest".to_string(),
            passcode: Secret::new("guest"),
        },
        tls: TlsSettings::default(),
    }
}

/// Read one frame (up to and including NUL), skipping heart-beats.
fn read_frame(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if out.is_empty() && (byte[0] == b'\n' || byte[0] == b'\r') {
                    continue;
                }
                if byte[0] == 0 {
                    break;
                }
                out.push(byte[0]);
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn header<'a>(frame: &'a str, name: &str) -> Option<&'a str> {
    frame
        .lines()
        .skip(1)
        .take_while(|l| !l.is_empty())
        .find_map(|l| l.strip_prefix(name)?.strip_prefix(':'))
}

fn send(stream: &mut TcpStream, frame: &str) {
    stream.write_all(frame.as_bytes()).unwrap();
    stream.flush().unwrap();
}

#[tokio::test]
async fn handshake_subscribe_and_deliver_into_sink() {
    let (listener, port) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let connect = read_frame(&mut stream);
        assert!(connect.starts_with("CONNECT"));
        assert_eq!(header(&connect, "accept-version"), Some("1.0,1.1,1.2"));
        assert_eq!(header(&connect, "host"), Some("/"));
        assert_eq!(header(&connect, "login"), Some("guest"));
        send(&mut stream, "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0");

        let subscribe = read_frame(&mut stream);
        assert!(subscribe.starts_with("SUBSCRIBE"));
        assert_eq!(header(&subscribe, "destination"), Some("/queue/a"));
        assert_eq!(header(&subscribe, "ack"), Some("auto"));
        let id = header(&subscribe, "id").unwrap().to_string();
        send(
            &mut stream,
            &format!(
                "MESSAGE\nsubscription:{}\nmessage-id:1\ndestination:/queue/a\n\nhello\0",
                id
            ),
        );

        let disconnect = read_frame(&mut stream);
        assert!(disconnect.starts_with("DISCONNECT"));
        let receipt = header(&disconnect, "receipt").unwrap().to_string();
        send(&mut stream, &format!("RECEIPT\nreceipt-id:{}\n\n\0", receipt));
    });

    let mut settings = StompSettings::for_destination("/queue/a");
    settings.host = "127.0.0.1".to_string();
    settings.port = port;
    settings.vhost = Some("/".to_string());
    settings.user = "guest".to_string();
    settings.password = Secret::new("guest");
    let mut input: StompInput = StompInput::new(settings).expect("settings");
    input.register().expect("register");
    let input = Arc::new(input);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = tokio::spawn({
        let input = input.clone();
        async move { input.start(tx).await }
    });

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within 5s")
        .expect("sink closed");
    assert_eq!(event.get_str("message"), Some("hello"));

    input.stop().await;
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("start did not return")
        .expect("join")
        .expect("start");
    server.join().unwrap();
}

#[tokio::test]
async fn error_with_version_header_is_unsupported_protocol() {
    let (listener, port) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_frame(&mut stream);
        send(
            &mut stream,
            "ERROR\nversion:2.0\nmessage:Supported protocol versions are 2.0\n\n\0",
        );
        thread::sleep(Duration::from_millis(100));
    });

    let client = StompClient::new(descriptor(port)).expect("client");
    match client.connect().await {
        Err(ConnectError::UnsupportedProtocolVersion(detail)) => assert!(detail.contains("2.0")),
        other => panic!("expected UnsupportedProtocolVersion, got {:?}", other),
    }
    assert!(!client.is_connected());
    server.join().unwrap();
}

#[tokio::test]
async fn error_without_version_is_a_plain_failure() {
    let (listener, port) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_frame(&mut stream);
        send(
            &mut stream,
            "ERROR\nmessage:Authentication failed\n\nInvalid credentials\0",
        );
        thread::sleep(Duration::from_millis(100));
    });

    let client = StompClient::new(descriptor(port)).expect("client");
    match client.connect().await {
        Err(ConnectError::Failed(detail)) => {
            assert!(detail.contains("Authentication failed: Invalid credentials"))
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    server.join().unwrap();
}

#[tokio::test]
async fn closed_port_is_refused() {
    let (listener, port) = listener();
    drop(listener);

    let client = StompClient::new(descriptor(port)).expect("client");
    match client.connect().await {
        Err(ConnectError::Refused(_)) => {}
        other => panic!("expected Refused, got {:?}", other),
    }
}

#[tokio::test]
async fn broker_closing_the_socket_fires_callback() {
    let (listener, port) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_frame(&mut stream);
        send(&mut stream, "CONNECTED\nversion:1.2\n\n\0");
        let _ = read_frame(&mut stream);
        drop(stream);
    });

    let client = StompClient::new(descriptor(port)).expect("client");
    let closed = Arc::new(Notify::new());
    client.on_connection_closed(Arc::new({
        let closed = closed.clone();
        move || closed.notify_one()
    }));

    client.connect().await.expect("connect");
    assert!(client.is_connected());
    let handler: MessageHandler = Arc::new(|_| {});
    client.subscribe("/queue/a", handler).await.expect("subscribe");

    tokio::time::timeout(Duration::from_secs(5), closed.notified())
        .await
        .expect("closed callback not fired");
    assert!(!client.is_connected());
    server.join().unwrap();
}

#[tokio::test]
async fn local_disconnect_does_not_fire_callback() {
    let (listener, port) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_frame(&mut stream);
        send(&mut stream, "CONNECTED\nversion:1.2\n\n\0");
        let disconnect = read_frame(&mut stream);
        if let Some(receipt) = header(&disconnect, "receipt") {
            send(&mut stream, &format!("RECEIPT\nreceipt-id:{}\n\n\0", receipt));
        }
    });

    let client = StompClient::new(descriptor(port)).expect("client");
    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    client.on_connection_closed(Arc::new({
        let fired = fired.clone();
        move || fired.store(true, std::sync::atomic::Ordering::SeqCst)
    }));

    client.connect().await.expect("connect");
    client.disconnect().await.expect("disconnect");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!client.is_connected());
    server.join().unwrap();
}

#[tokio::test]
async fn panicking_handler_ends_session_and_fires_callback() {
    let (listener, port) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_frame(&mut stream);
        send(&mut stream, "CONNECTED\nversion:1.2\n\n\0");
        let subscribe = read_frame(&mut stream);
        let id = header(&subscribe, "id").unwrap().to_string();
        send(
            &mut stream,
            &format!("MESSAGE\nsubscription:{}\nmessage-id:1\n\nboom\0", id),
        );
        thread::sleep(Duration::from_millis(200));
    });

    let client = StompClient::new(descriptor(port)).expect("client");
    let closed = Arc::new(Notify::new());
    client.on_connection_closed(Arc::new({
        let closed = closed.clone();
        move || closed.notify_one()
    }));

    client.connect().await.expect("connect");
    let handler: MessageHandler = Arc::new(|_| panic!("handler failure"));
    client.subscribe("/queue/a", handler).await.expect("subscribe");

    tokio::time::timeout(Duration::from_secs(5), closed.notified())
        .await
        .expect("closed callback not fired after handler panic");
    assert!(!client.is_connected());
    server.join().unwrap();
}
