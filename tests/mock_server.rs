//! Protocol tests against an in-process fake server.
//!
//! These spin up a TcpListener that speaks just enough of the server side of
//! the protocol to drive the client through handshake, authentication, and
//! the text query path, without needing a MySQL instance.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mywire::{AsyncConnection, Config, ConnectionState, Error, SslMode, Value};

const CAPS_BASE: u32 = (1 << 9) // CLIENT_PROTOCOL_41
    | (1 << 15) // CLIENT_SECURE_CONNECTION
    | (1 << 19) // CLIENT_PLUGIN_AUTH
    | (1 << 21); // CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA

const CAPS_DEPRECATE_EOF: u32 = CAPS_BASE | (1 << 24);

async fn write_packet(stream: &mut TcpStream, payload: &[u8], seq: u8) {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push((payload.len() & 0xFF) as u8);
    frame.push(((payload.len() >> 8) & 0xFF) as u8);
    frame.push(((payload.len() >> 16) & 0xFF) as u8);
    frame.push(seq);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

async fn read_packet(stream: &mut TcpStream) -> (Vec<u8>, u8) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let len =
        usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (payload, header[3])
}

fn handshake_payload(caps: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.push(10); // protocol version
    p.extend_from_slice(b"8.0.36-mock\0");
    p.extend_from_slice(&7u32.to_le_bytes()); // connection id
    p.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // salt part 1
    p.push(0); // filler
    p.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
    p.push(255); // charset
    p.extend_from_slice(&2u16.to_le_bytes()); // status flags
    p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    p.push(21); // auth data length
    p.extend_from_slice(&[0; 10]); // reserved
    p.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]); // part 2 + NUL
    p.extend_from_slice(b"mysql_native_password\0");
    p
}

fn ok_payload(affected: u64, status: u16) -> Vec<u8> {
    assert!(affected < 251, "test helper handles small counts only");
    vec![
        0x00,
        affected as u8,
        0x00, // last insert id
        (status & 0xFF) as u8,
        (status >> 8) as u8,
        0x00,
        0x00, // warnings
    ]
}

fn eof_payload(status: u16) -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, (status & 0xFF) as u8, (status >> 8) as u8]
}

fn column_def_payload(name: &str, type_id: u8) -> Vec<u8> {
    let mut p = Vec::new();
    for field in ["def", "", "", "", name, name] {
        p.push(field.len() as u8);
        p.extend_from_slice(field.as_bytes());
    }
    p.push(0x0C);
    p.extend_from_slice(&45u16.to_le_bytes()); // utf8mb4
    p.extend_from_slice(&11u32.to_le_bytes()); // display length
    p.push(type_id);
    p.extend_from_slice(&0u16.to_le_bytes()); // flags
    p.push(0); // decimals
    p.extend_from_slice(&[0, 0]);
    p
}

/// Run the server half of connect + auth, then answer the client's
/// `SET NAMES` session setup with OK.
async fn serve_connect(stream: &mut TcpStream, caps: u32) {
    write_packet(stream, &handshake_payload(caps), 0).await;

    let (_response, seq) = read_packet(stream).await;
    assert_eq!(seq, 1, "handshake response keeps the sequence");
    write_packet(stream, &ok_payload(0, 2), 2).await;

    // SET NAMES utf8mb4
    let (query, seq) = read_packet(stream).await;
    assert_eq!(seq, 0, "commands restart the sequence");
    assert_eq!(query[0], 0x03);
    assert!(query[1..].starts_with(b"SET NAMES"));
    write_packet(stream, &ok_payload(0, 2), 1).await;
}

fn test_config(port: u16) -> Config {
    Config::new()
        .host("127.0.0.1")
        .port(port)
        .user("root")
        .ssl_mode(SslMode::Disabled)
}

#[tokio::test]
async fn connect_and_select_legacy_eof() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect(&mut stream, CAPS_BASE).await;

        // SELECT 42 -> one column, one row, legacy EOF framing
        let (query, _) = read_packet(&mut stream).await;
        assert_eq!(&query[1..], b"SELECT 42");
        write_packet(&mut stream, &[0x01], 1).await;
        write_packet(&mut stream, &column_def_payload("42", 0x08), 2).await;
        write_packet(&mut stream, &eof_payload(2), 3).await;
        write_packet(&mut stream, &[0x02, b'4', b'2'], 4).await;
        write_packet(&mut stream, &eof_payload(2), 5).await;
    });

    let mut conn = AsyncConnection::connect(test_config(port)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(conn.connection_id(), 7);
    assert_eq!(conn.server_version(), Some("8.0.36-mock"));

    let result = conn.query("SELECT 42").await.unwrap();
    let rows = result.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].columns().name_at(0), Some("42"));
    assert_eq!(rows[0].get(0), Some(&Value::Int(42)));
    assert_eq!(rows[0].get_by_name("42"), Some(&Value::Int(42)));

    server.await.unwrap();
}

#[tokio::test]
async fn select_with_deprecate_eof_terminal_ok() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect(&mut stream, CAPS_DEPRECATE_EOF).await;

        let (query, _) = read_packet(&mut stream).await;
        assert_eq!(&query[1..], b"SELECT 'h\xc3\xa9llo'");
        write_packet(&mut stream, &[0x01], 1).await;
        write_packet(&mut stream, &column_def_payload("h\u{e9}llo", 0xFD), 2).await;
        // No EOF after columns; rows immediately
        write_packet(&mut stream, &[0x06, 0x68, 0xC3, 0xA9, 0x6C, 0x6C, 0x6F], 3).await;
        // Terminal OK wearing the 0xFE header
        let terminal = vec![0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        write_packet(&mut stream, &terminal, 4).await;
    });

    let mut conn = AsyncConnection::connect(test_config(port)).await.unwrap();
    let result = conn.query("SELECT 'héllo'").await.unwrap();
    let rows = result.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Value::Text("héllo".to_string())));
    assert_eq!(conn.state(), ConnectionState::Idle);

    server.await.unwrap();
}

#[tokio::test]
async fn server_error_leaves_connection_usable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect(&mut stream, CAPS_BASE).await;

        // First query: ERR 1146
        let (_, _) = read_packet(&mut stream).await;
        let mut err = vec![0xFF, 0x7A, 0x04, b'#'];
        err.extend_from_slice(b"42S02");
        err.extend_from_slice(b"Table 'test.missing' doesn't exist");
        write_packet(&mut stream, &err, 1).await;

        // Second query: plain OK
        let (_, seq) = read_packet(&mut stream).await;
        assert_eq!(seq, 0);
        write_packet(&mut stream, &ok_payload(1, 2), 1).await;
    });

    let mut conn = AsyncConnection::connect(test_config(port)).await.unwrap();

    let err = conn.query("SELECT * FROM missing").await.unwrap_err();
    match &err {
        Error::Server {
            code,
            sqlstate,
            message,
        } => {
            assert_eq!(*code, 1146);
            assert_eq!(sqlstate, "42S02");
            assert!(message.contains("missing"));
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert!(!err.is_fatal());
    assert_eq!(conn.state(), ConnectionState::Idle);

    // Still usable after a server error
    let result = conn.query("DELETE FROM t").await.unwrap();
    assert_eq!(result.affected_rows(), 1);

    server.await.unwrap();
}

#[tokio::test]
async fn sequence_desync_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect(&mut stream, CAPS_BASE).await;

        let (_, _) = read_packet(&mut stream).await;
        // Answer with a wildly wrong sequence id
        write_packet(&mut stream, &ok_payload(0, 2), 9).await;
    });

    let mut conn = AsyncConnection::connect(test_config(port)).await.unwrap();
    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(matches!(
        err,
        Error::SequenceDesync {
            expected: 1,
            actual: 9
        }
    ));
    assert!(err.is_fatal());
    assert_eq!(conn.state(), ConnectionState::Closed);

    // The dead connection refuses further commands without touching the wire
    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    server.await.unwrap();
}

#[tokio::test]
async fn multi_result_sets_drain_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_connect(&mut stream, CAPS_BASE).await;

        let (_, _) = read_packet(&mut stream).await;
        // OK with SERVER_MORE_RESULTS_EXISTS (0x0008)
        write_packet(&mut stream, &ok_payload(1, 0x0A), 1).await;
        // Second result set: OK without the flag
        write_packet(&mut stream, &ok_payload(2, 0x02), 2).await;
    });

    let mut conn = AsyncConnection::connect(test_config(port)).await.unwrap();
    let first = conn.query("INSERT 1; INSERT 2").await.unwrap();
    assert!(first.more_results());

    let second = conn.next_result().await.unwrap().expect("second result");
    assert_eq!(second.affected_rows(), 2);
    assert!(!second.more_results());
    assert!(conn.next_result().await.unwrap().is_none());

    server.await.unwrap();
}
