pub mod router;

pub use router::*;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("request frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("malformed request frame: {0}")]
    MalformedFrame(String),
}

/// Frames are length-prefixed: `[u32 LE length][payload]`. The ceiling
/// leaves headroom over the 300 MiB base64 scan body.
const MAX_FRAME_BYTES: usize = 320 * 1024 * 1024;

/// Local stream-socket server. One task per client connection; requests
/// on a connection are handled strictly in order, so each client observes
/// its own replies sequentially. No ordering holds across clients.
pub struct SentinelServer {
    router: Arc<RequestRouter>,
    socket_path: PathBuf,
    next_client_id: AtomicU64,
    active_connections: Arc<AtomicUsize>,
}

impl SentinelServer {
    pub fn new(router: Arc<RequestRouter>, socket_path: PathBuf) -> Self {
        Self {
            router,
            socket_path,
            next_client_id: AtomicU64::new(1),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        self.active_connections.clone()
    }

    /// Accept loop; runs until the task is cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        // A stale socket file from a previous run would make bind fail.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("listening on {}", self.socket_path.display());

        loop {
            let (stream, _addr) = listener.accept().await?;
            let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            let router = self.router.clone();
            let active = self.active_connections.clone();

            active.fetch_add(1, Ordering::Relaxed);
            debug!("client {client_id} connected");

            tokio::spawn(async move {
                if let Err(e) = serve_connection(router.clone(), stream, client_id).await {
                    debug!("client {client_id} closed: {e}");
                }
                router.rate_limiter().forget_client(client_id);
                active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn serve_connection(
    router: Arc<RequestRouter>,
    mut stream: UnixStream,
    client_id: u64,
) -> Result<(), ServerError> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let reply = match serde_json::from_slice::<serde_json::Value>(&frame) {
            Ok(request) => router.handle_request(client_id, request).await,
            Err(e) => {
                warn!("client {client_id} sent malformed JSON: {e}");
                serde_json::json!({
                    "request_id": "",
                    "status": "error",
                    "error": "Malformed JSON request",
                })
            }
        };

        write_frame(&mut stream, &serde_json::to_vec(&reply).unwrap_or_default()).await?;
    }
}

async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>, ServerError> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ServerError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<(), ServerError> {
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}
