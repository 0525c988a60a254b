use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use phaser_core::identity::DeviceIdentity;
use phaser_core::net::messages::{
    ClientMessage, HitReportMsg, RegisterAckMsg, RegisterMsg, ServerMessage,
};
use phaser_core::net::protocol::{PROTOCOL_VERSION, decode_server_message, encode_client_message};
use phaser_core::test_helpers::make_identity;

use phaser_server::config::{AuthFileConfig, ServerConfig};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    _shutdown: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server with no auth.
    pub async fn new() -> Self {
        Self::from_config(ServerConfig::default()).await
    }

    /// Start a test server whose admin API needs `token`.
    pub async fn with_auth(token: &str) -> Self {
        let config = ServerConfig {
            auth: AuthFileConfig {
                bearer_token: Some(token.to_string()),
            },
            ..ServerConfig::default()
        };
        Self::from_config(config).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            phaser_server::serve(listener, config).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            _shutdown: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Send a Register and return the ack, whatever it says.
pub async fn ws_register_identity(
    stream: &mut WsStream,
    identity: DeviceIdentity,
    protocol_version: u8,
) -> RegisterAckMsg {
    let msg = ClientMessage::Register(RegisterMsg {
        identity,
        protocol_version,
    });
    ws_send_client_msg(stream, &msg).await;
    match ws_read_server_msg(stream).await {
        ServerMessage::RegisterAck(ack) => ack,
        other => panic!("Expected RegisterAck, got: {other:?}"),
    }
}

/// Connect and register a weapon, consuming the welcome (ack, config, state).
pub async fn ws_join(server: &TestServer, device: u8, player: u16, team: u8) -> WsStream {
    let mut stream = ws_connect(&server.ws_url()).await;
    let ack =
        ws_register_identity(&mut stream, make_identity(device, player, team), PROTOCOL_VERSION)
            .await;
    assert!(ack.success, "Expected successful register: {ack:?}");
    assert!(matches!(
        ws_read_server_msg(&mut stream).await,
        ServerMessage::ConfigUpdate(_)
    ));
    assert!(matches!(
        ws_read_server_msg(&mut stream).await,
        ServerMessage::GameState(_)
    ));
    stream
}

pub async fn ws_report_hit(stream: &mut WsStream, shooter_id: u16, target_id: u16) {
    let msg = ClientMessage::HitReport(HitReportMsg {
        shooter_id,
        target_id,
        payload: 0,
    });
    ws_send_client_msg(stream, &msg).await;
}

/// Read raw binary data from a WebSocket stream (5s timeout).
pub async fn ws_read_raw(stream: &mut WsStream) -> Vec<u8> {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Try to read raw binary data, returning None on timeout.
pub async fn ws_try_read_raw(stream: &mut WsStream, timeout_ms: u64) -> Option<Vec<u8>> {
    let deadline = Duration::from_millis(timeout_ms);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    panic!("WebSocket error or closed")
                },
                _ => continue,
            }
        }
    })
    .await
    .ok()
}

/// Wait for the server to close the connection (5s timeout).
pub async fn ws_expect_closed(stream: &mut WsStream) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(Message::Binary(_))) => continue,
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for the server to close");
}

pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let data = ws_read_raw(stream).await;
    decode_server_message(&data).unwrap()
}

pub async fn ws_send_client_msg(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Binary(encoded.into())).await.unwrap();
}
