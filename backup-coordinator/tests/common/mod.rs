//! A scripted sidecar for driving workers over real sockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use backup_wire::{BackupRequest, FrameTransport};

#[derive(Debug, Clone)]
pub enum Script {
    /// Behave like a real sidecar serving `payload`: `SAME` when the
    /// request checksum matches, otherwise `DIFF` with the payload.
    Serve(Vec<u8>),
    /// `DIFF` with the payload followed by a checksum that does not match.
    WrongChecksum(Vec<u8>),
    Abort,
}

pub struct StubSidecar {
    pub addr: SocketAddr,
    script: Arc<Mutex<Script>>,
    requests: Arc<Mutex<Vec<BackupRequest>>>,
    task: JoinHandle<()>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    backup_core::digest::sha256_bytes(bytes)
}

impl StubSidecar {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let script = Arc::new(Mutex::new(script));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let script = script.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let script = script.lock().unwrap().clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = serve_one(stream, script, requests).await;
                    });
                }
            })
        };

        Self {
            addr,
            script,
            requests,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn requests(&self) -> Vec<BackupRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubSidecar {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(
    stream: tokio::net::TcpStream,
    script: Script,
    requests: Arc<Mutex<Vec<BackupRequest>>>,
) -> Result<(), backup_wire::WireError> {
    let mut transport = FrameTransport::new(stream);
    let text = transport.receive_text().await?;
    let request: BackupRequest = serde_json::from_str(&text)?;
    let previous = request.checksum.clone();
    requests.lock().unwrap().push(request);

    match script {
        Script::Abort => transport.send_text("ABORT").await?,
        Script::Serve(payload) => {
            let checksum = sha256_hex(&payload);
            if checksum == previous {
                transport.send_text("SAME").await?;
            } else {
                transport.send_text("DIFF").await?;
                transport.send_bytes(&payload).await?;
                transport.send_text(&checksum).await?;
            }
        }
        Script::WrongChecksum(payload) => {
            transport.send_text("DIFF").await?;
            transport.send_bytes(&payload).await?;
            transport.send_text(&sha256_hex(b"something else")).await?;
        }
    }
    transport.close().await
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
