//! Live control of a generation run from another process.
//!
//! The sled store is held exclusively by the process that opened it, so a
//! second invocation cannot reach a running session through the store. While
//! a run is in progress its process serves pause, resume, parallelism and
//! status requests on a loopback socket, one JSON object per line, and writes
//! the bound address to a file beside the store.

use crate::api::{GeneratorApi, ResumeReport};
use crate::control::StatusReport;
use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Pause { session_id: String },
    Resume { session_id: String },
    Parallel { session_id: String, parallel: usize },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    Paused,
    Resumed { report: ResumeReport },
    Parallel { applied: usize },
    Status { report: StatusReport },
    Error { message: String },
}

fn dispatch(api: &GeneratorApi, request: ControlRequest) -> ControlReply {
    let result = match request {
        ControlRequest::Pause { session_id } => {
            api.pause_session(&session_id).map(|()| ControlReply::Paused)
        }
        ControlRequest::Resume { session_id } => api
            .unpause_session(&session_id)
            .map(|report| ControlReply::Resumed { report }),
        ControlRequest::Parallel {
            session_id,
            parallel,
        } => api
            .set_session_parallel(&session_id, parallel)
            .map(|applied| ControlReply::Parallel { applied }),
        ControlRequest::Status => api
            .session_status()
            .map(|report| ControlReply::Status { report }),
    };
    result.unwrap_or_else(|err| ControlReply::Error {
        message: err.to_string(),
    })
}

/// Listener serving control requests for the lifetime of a run.
///
/// Dropping it stops the listener and removes the address file.
pub struct ControlServer {
    address: SocketAddr,
    address_file: PathBuf,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind an ephemeral loopback port and advertise it in `address_file`.
    pub async fn start(api: Arc<GeneratorApi>, address_file: PathBuf) -> Result<Self, ApiError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ApiError::ControlChannel(format!("failed to bind listener: {}", e)))?;
        let address = listener
            .local_addr()
            .map_err(|e| ApiError::ControlChannel(e.to_string()))?;
        std::fs::write(&address_file, address.to_string()).map_err(|e| {
            ApiError::ControlChannel(format!(
                "failed to write {}: {}",
                address_file.display(),
                e
            ))
        })?;
        info!(%address, file = %address_file.display(), "Control listener started");

        let task = tokio::spawn(serve(listener, api));
        Ok(Self {
            address,
            address_file,
            task,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.address_file) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, file = %self.address_file.display(), "Failed to remove control address file");
            }
        }
        debug!(address = %self.address, "Control listener stopped");
    }
}

async fn serve(listener: TcpListener, api: Arc<GeneratorApi>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let api = Arc::clone(&api);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &api).await {
                        debug!(%peer, error = %e, "Control connection closed with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Control listener accept failed"),
        }
    }
}

async fn handle_connection(stream: TcpStream, api: &GeneratorApi) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => {
                debug!(?request, "Control request received");
                dispatch(api, request)
            }
            Err(e) => ControlReply::Error {
                message: format!("malformed control request: {}", e),
            },
        };
        write_line(&mut write, &reply).await?;
    }
    Ok(())
}

async fn write_line<T: Serialize>(write: &mut OwnedWriteHalf, value: &T) -> io::Result<()> {
    let mut encoded = serde_json::to_string(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    encoded.push('\n');
    write.write_all(encoded.as_bytes()).await
}

/// Connection to the process advertised in an address file.
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect to the advertised process. `None` when no run is advertising or
    /// the advertised process is gone.
    pub async fn connect(address_file: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(address_file).ok()?;
        let address: SocketAddr = match raw.trim().parse() {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, file = %address_file.display(), "Ignoring unreadable control address");
                return None;
            }
        };
        match TcpStream::connect(address).await {
            Ok(stream) => {
                debug!(%address, "Connected to running generator");
                let (read, write) = stream.into_split();
                Some(Self {
                    lines: BufReader::new(read).lines(),
                    write,
                })
            }
            Err(e) => {
                debug!(%address, error = %e, "Stale control address");
                None
            }
        }
    }

    pub async fn request(&mut self, request: &ControlRequest) -> Result<ControlReply, ApiError> {
        let channel_err = |e: io::Error| ApiError::ControlChannel(e.to_string());
        write_line(&mut self.write, request)
            .await
            .map_err(channel_err)?;
        let line = self
            .lines
            .next_line()
            .await
            .map_err(channel_err)?
            .ok_or_else(|| ApiError::ControlChannel("connection closed".to_string()))?;
        let reply: ControlReply = serde_json::from_str(&line)
            .map_err(|e| ApiError::ControlChannel(format!("malformed reply: {}", e)))?;
        match reply {
            ControlReply::Error { message } => Err(ApiError::ControlChannel(message)),
            reply => Ok(reply),
        }
    }
}
