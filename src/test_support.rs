//! Test doubles for the remote debugging endpoint.
//!
//! [`MockServer`] speaks the server side of the WebSocket handshake and
//! frame protocol on a random localhost port. [`DiscoveryEndpoint`] answers
//! `/json/version` and `/json/list` like a browser's HTTP endpoint.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::transport::frame::{Frame, FrameCodec, OpCode};
use crate::transport::handshake::accept_key;

/// Installs a test subscriber once; honours `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Returns a localhost port with nothing listening on it.
pub(crate) fn unused_port() -> u16 {
    let listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
    listener.local_addr().expect("local addr").port()
}

// ============================================================================
// MockServer
// ============================================================================

/// Reply script: maps a parsed client request to the texts sent back.
pub(crate) type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

#[derive(Clone)]
enum Behavior {
    Echo,
    Silent,
    BadAccept,
    Stalled,
    Respond(Responder),
}

enum ServerCommand {
    Raw(Vec<u8>),
    Disconnect,
}

/// Single-connection WebSocket server.
pub(crate) struct MockServer {
    port: u16,
    commands: mpsc::UnboundedSender<ServerCommand>,
    client_frames: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    _task: JoinHandle<()>,
}

impl MockServer {
    /// Echoes every text frame back.
    pub(crate) async fn echo() -> Self {
        Self::start(Behavior::Echo).await
    }

    /// Never replies on its own; the test pushes frames.
    pub(crate) async fn silent() -> Self {
        Self::start(Behavior::Silent).await
    }

    /// Completes the upgrade, then never reads from the socket again.
    pub(crate) async fn stalled() -> Self {
        Self::start(Behavior::Stalled).await
    }

    /// Answers the upgrade with a wrong accept value.
    pub(crate) async fn with_bad_accept() -> Self {
        Self::start(Behavior::BadAccept).await
    }

    /// Answers each JSON request with the texts returned by `responder`.
    pub(crate) async fn responding<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        Self::start(Behavior::Respond(Arc::new(responder))).await
    }

    async fn start(behavior: Behavior) -> Self {
        init_tracing();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (frame_tx, client_frames) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                serve(stream, behavior, command_rx, frame_tx).await;
            }
        });

        Self {
            port,
            commands,
            client_frames: AsyncMutex::new(client_frames),
            _task: task,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/devtools/browser/mock", self.port)
    }

    /// Sends raw bytes to the client.
    pub(crate) fn push_raw(&self, bytes: Vec<u8>) {
        let _ = self.commands.send(ServerCommand::Raw(bytes));
    }

    /// Sends one unmasked frame to the client.
    pub(crate) fn push_frame(&self, opcode: OpCode, payload: Vec<u8>) {
        self.push_raw(FrameCodec::encode_with_key(&payload, opcode, true, None));
    }

    /// Sends one text message to the client.
    pub(crate) fn push_text(&self, text: impl Into<String>) {
        self.push_frame(OpCode::Text, text.into().into_bytes());
    }

    /// Sends a JSON value as a text message.
    pub(crate) fn push_json(&self, value: Value) {
        self.push_text(value.to_string());
    }

    /// Drops the socket without a close frame.
    pub(crate) fn disconnect(&self) {
        let _ = self.commands.send(ServerCommand::Disconnect);
    }

    /// Waits for the next frame the client sent.
    pub(crate) async fn next_client_frame(&self, wait: Duration) -> Option<Frame> {
        let mut frames = self.client_frames.lock().await;
        timeout(wait, frames.recv()).await.ok().flatten()
    }

    /// Waits for the next text message the client sent, parsed as JSON.
    pub(crate) async fn next_request(&self, wait: Duration) -> Option<Value> {
        loop {
            let frame = self.next_client_frame(wait).await?;
            if frame.opcode == OpCode::Text {
                return serde_json::from_slice(&frame.payload).ok();
            }
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    behavior: Behavior,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
    frames: mpsc::UnboundedSender<Frame>,
) {
    let Some(leftover) = accept_upgrade(&mut stream, &behavior).await else {
        return;
    };

    if matches!(behavior, Behavior::Stalled) {
        // Keep the socket open until told otherwise; the client's writes back up.
        while let Some(command) = commands.recv().await {
            if matches!(command, ServerCommand::Disconnect) {
                break;
            }
        }
        drop(stream);
        return;
    }

    let mut codec = FrameCodec::new();
    codec.feed(&leftover);
    let mut buf = vec![0u8; 8192];

    loop {
        while let Ok(Some(frame)) = codec.decode(&[]) {
            let mut replies = Vec::new();
            match (&behavior, frame.opcode) {
                (_, OpCode::Close) => {
                    let ack = FrameCodec::encode_with_key(&frame.payload, OpCode::Close, true, None);
                    let _ = stream.write_all(&ack).await;
                    let _ = frames.send(frame);
                    return;
                }
                (Behavior::Echo, OpCode::Text) => replies.push(frame.payload.clone()),
                (Behavior::Respond(responder), OpCode::Text) => {
                    if let Ok(request) = serde_json::from_slice::<Value>(&frame.payload) {
                        replies.extend(responder(&request).into_iter().map(String::into_bytes));
                    }
                }
                _ => {}
            }
            let _ = frames.send(frame);
            for reply in replies {
                let bytes = FrameCodec::encode_with_key(&reply, OpCode::Text, true, None);
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => codec.feed(&buf[..n]),
            },
            command = commands.recv() => match command {
                Some(ServerCommand::Raw(bytes)) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Some(ServerCommand::Disconnect) | None => return,
            },
        }
    }
}

/// Reads the upgrade request and answers it. Returns bytes past the head.
async fn accept_upgrade(stream: &mut TcpStream, behavior: &Behavior) -> Option<Vec<u8>> {
    let (head, leftover) = read_head(stream).await?;

    let key = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-key"))
        .map(|(_, value)| value.trim().to_string())?;

    let accept = match behavior {
        Behavior::BadAccept => "bm9wZQ==".to_string(),
        _ => accept_key(&key),
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await.ok()?;
    Some(leftover)
}

async fn read_head(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&received[..pos]).into_owned();
            let leftover = received[pos + 4..].to_vec();
            return Some((head, leftover));
        }
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        received.extend_from_slice(&buf[..n]);
    }
}

/// Builds a `{"id": .., "result": ..}` response text.
pub(crate) fn result_for(request: &Value, result: Value) -> String {
    json!({ "id": request["id"], "result": result }).to_string()
}

// ============================================================================
// DiscoveryEndpoint
// ============================================================================

/// HTTP endpoint answering `/json/version` and `/json/list`.
pub(crate) struct DiscoveryEndpoint {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl DiscoveryEndpoint {
    /// Serves discovery documents pointing at `ws_url`.
    pub(crate) async fn start(ws_url: &str) -> Self {
        init_tracing();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind discovery endpoint");
        let addr = listener.local_addr().expect("local addr");

        let version = json!({
            "Browser": "HeadlessChrome/126.0.6478.126",
            "Protocol-Version": "1.3",
            "User-Agent": "Mozilla/5.0 HeadlessChrome/126.0.6478.126",
            "V8-Version": "12.6.228.28",
            "WebKit-Version": "537.36",
            "webSocketDebuggerUrl": ws_url,
        })
        .to_string();
        let list = json!([
            {
                "id": "BG",
                "type": "service_worker",
                "title": "worker",
                "url": "chrome-extension://x/bg.js",
                "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/BG",
            },
            {
                "id": "PAGE1",
                "type": "page",
                "title": "about:blank",
                "url": "about:blank",
                "webSocketDebuggerUrl": ws_url,
            }
        ])
        .to_string();

        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let version = version.clone();
                let list = list.clone();
                tokio::spawn(async move {
                    let Some((head, _)) = read_head(&mut stream).await else {
                        return;
                    };
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = match path.as_str() {
                        "/json/version" => ("200 OK", version),
                        "/json/list" | "/json" => ("200 OK", list),
                        _ => ("404 Not Found", String::new()),
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\n\
                         Content-Type: application/json\r\n\
                         Content-Length: {}\r\n\
                         Connection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { addr, task }
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stops accepting connections.
    pub(crate) fn stop(self) {
        self.task.abort();
    }
}
