//! Control socket.
//!
//! Each connection carries one JSON request line. A [`ProcessCommand`] gets
//! exactly one [`ControlResponse`] line back; `{"action":"subscribe"}` keeps
//! the connection open and streams [`EnforcementEvent`] lines until either
//! side goes away.

use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::events::EnforcementEvent;
use crate::platform::common::{ensure_directory_exists, set_file_permissions};
use crate::process::{ControlResponse, ProcessCommand, ProcessHandle};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIBE_ACTION: &str = "subscribe";

pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
    handle: ProcessHandle,
}

impl ControlServer {
    /// Bind the socket, replacing a stale one left by a crashed process
    pub fn bind(socket_path: &Path, handle: ProcessHandle) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path).with_context(|| {
                format!("Failed to remove existing socket: {}", socket_path.display())
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            ensure_directory_exists(parent)?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind control socket: {}", socket_path.display()))?;
        set_file_permissions(socket_path, 0o600)?;

        info!("Control socket listening on {}", socket_path.display());

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            handle,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    pub async fn serve(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if !peer_allowed(&stream) {
                            continue;
                        }
                        let handle = self.handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handle).await {
                                debug!("Control connection ended: {:#}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                },
                _ = &mut shutdown => break,
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Failed to remove control socket: {}", e);
        }
        info!("Control socket closed");
    }
}

/// Only the owning user and root may talk to the process
fn peer_allowed(stream: &UnixStream) -> bool {
    let euid = unsafe { libc::geteuid() };

    match stream.peer_cred() {
        Ok(cred) if cred.uid() == euid || cred.uid() == 0 => true,
        Ok(cred) => {
            warn!("Rejected control connection from uid {}", cred.uid());
            false
        }
        Err(e) => {
            warn!("Could not identify control peer: {}", e);
            false
        }
    }
}

async fn serve_connection(stream: UnixStream, handle: ProcessHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("Timed out waiting for request")?
        .context("Failed to read request")?;

    let request: serde_json::Value = match serde_json::from_str(line.trim()) {
        Ok(value) => value,
        Err(e) => {
            let response = ControlResponse::from(ControlError::InvalidArgument(format!(
                "malformed request: {}",
                e
            )));
            return write_line(&mut writer, &response).await;
        }
    };

    if request.get("action").and_then(|a| a.as_str()) == Some(SUBSCRIBE_ACTION) {
        return stream_events(&mut writer, handle).await;
    }

    let response = match serde_json::from_value::<ProcessCommand>(request) {
        Ok(command) => handle
            .send(command)
            .await
            .unwrap_or_else(ControlResponse::from),
        Err(e) => ControlError::InvalidArgument(format!("unknown command: {}", e)).into(),
    };

    write_line(&mut writer, &response).await
}

async fn stream_events(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    handle: ProcessHandle,
) -> Result<()> {
    let mut events = handle.subscribe();
    debug!("Event subscriber connected");

    loop {
        match events.recv().await {
            Ok(event) => write_line(writer, &event).await?,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event subscriber fell behind; {} events dropped", skipped);
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_string(value).context("Failed to serialize message")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("Failed to write to control socket")?;
    writer.flush().await.context("Failed to flush control socket")
}

/// Client side of the control socket
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.with_context(|| {
            format!(
                "Failed to connect to control socket at {}. Is kids-guard running?",
                self.socket_path.display()
            )
        })
    }

    /// Whether a process is accepting connections
    pub async fn is_running(&self) -> bool {
        self.socket_path.exists() && self.connect().await.is_ok()
    }

    /// Send one command and wait for its response
    pub async fn request(&self, command: &ProcessCommand) -> Result<ControlResponse> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        write_line(&mut writer, command).await?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("Timed out waiting for response")?
            .context("Failed to read response")?;

        if line.trim().is_empty() {
            bail!("Connection closed before a response was received");
        }

        serde_json::from_str(line.trim())
            .with_context(|| format!("Failed to parse response: {}", line.trim()))
    }

    /// Open an event stream
    pub async fn subscribe(&self) -> Result<EventStream> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        write_line(&mut writer, &serde_json::json!({ "action": SUBSCRIBE_ACTION })).await?;

        Ok(EventStream {
            reader: BufReader::new(reader),
            _writer: writer,
        })
    }
}

pub struct EventStream {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    _writer: tokio::net::unix::OwnedWriteHalf,
}

impl EventStream {
    /// Next event, or `None` once the process closes the stream
    pub async fn next(&mut self) -> Result<Option<EnforcementEvent>> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .context("Failed to read event")?;
        if read == 0 {
            return Ok(None);
        }

        serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| anyhow!("Failed to parse event {}: {}", line.trim(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::platform::Platform;
    use crate::process::EnforcementProcess;
    use crate::store::PrefsStore;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    struct Running {
        _dir: tempfile::TempDir,
        client: ControlClient,
        handles: crate::platform::memory::SimulatedHandles,
        stop: oneshot::Sender<()>,
    }

    async fn start() -> Running {
        let dir = tempdir().unwrap();
        let (platform, handles) = Platform::simulated();
        let process = EnforcementProcess::new(
            EngineConfig::default(),
            platform,
            PrefsStore::new(dir.path()),
            ManualClock::new(1_000_000),
        );
        let (handle, commands) = process.control_channel(8);
        tokio::spawn(process.run(commands));

        let socket = dir.path().join("run").join("kids-guard.sock");
        let server = ControlServer::bind(&socket, handle).unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));

        Running {
            client: ControlClient::new(&socket),
            _dir: dir,
            handles,
            stop,
        }
    }

    #[tokio::test]
    async fn request_response_over_socket() {
        let running = start().await;
        assert!(running.client.is_running().await);

        let response = running
            .client
            .request(&ProcessCommand::SetVolume { percent: 100 })
            .await
            .unwrap();
        assert_eq!(response, ControlResponse::Percent { percent: 100 });
        assert_eq!(running.handles.volume.value(), 15);

        let ControlResponse::Status(status) = running
            .client
            .request(&ProcessCommand::Status)
            .await
            .unwrap()
        else {
            panic!("expected status");
        };
        assert!(!status.locked);
    }

    #[tokio::test]
    async fn malformed_request_gets_error_line() {
        let running = start().await;

        let mut stream = UnixStream::connect(&running.client.socket_path).await.unwrap();
        stream.write_all(b"{\"action\":\"reboot\"}\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();

        let response: ControlResponse = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(
            response,
            ControlResponse::Error { ref code, .. } if code == "INVALID_ARGUMENT"
        ));
    }

    #[tokio::test]
    async fn subscribers_receive_corrections() {
        let running = start().await;
        let mut events = running.client.subscribe().await.unwrap();
        // let the server register the subscription
        tokio::time::sleep(Duration::from_millis(50)).await;

        running
            .client
            .request(&ProcessCommand::UpdateBrightness {
                value: 50,
                enforcing: true,
            })
            .await
            .unwrap();
        running.handles.brightness.set_external(0);

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event, EnforcementEvent::BrightnessEnforced { from: 0, to: 50 });
    }

    #[tokio::test]
    async fn socket_removed_on_shutdown() {
        let running = start().await;
        let socket = running.client.socket_path.clone();
        running.stop.send(()).unwrap();

        for _ in 0..50 {
            if !socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!socket.exists());
        assert!(!running.client.is_running().await);
    }
}
