use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::framing::{self, TransferMetadata};
use crate::error::TransferError;

// Constants for file transfer
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
pub const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Status of a file transfer, reported via progress callback
#[derive(Debug, Clone)]
pub enum TransferStatus {
    /// Metadata exchanged, content about to flow
    Started {
        transfer_id: Uuid,
        direction: TransferDirection,
        file_name: String,
        file_size: u64,
    },
    /// One chunk has been sent or stored
    Progress {
        transfer_id: Uuid,
        bytes_transferred: u64,
        total_bytes: u64,
        percent_complete: u8,
    },
    /// Transfer completed successfully
    Completed {
        transfer_id: Uuid,
        bytes_transferred: u64,
        elapsed_seconds: f32,
        throughput_mbps: f32,
    },
    /// Transfer failed or was cancelled
    Failed { transfer_id: Uuid, error: String },
}

/// Role of a session on its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Type of progress callback for file transfers
pub type ProgressCallback = Arc<dyn Fn(TransferStatus) + Send + Sync>;

/// Configuration for file transfers
#[derive(Clone)]
pub struct FileTransferConfig {
    /// Port the receiver listens on and the sender connects to
    pub port: u16,
    /// Address the receiver binds
    pub bind_address: IpAddr,
    /// Size of chunks read from disk and from the socket
    pub chunk_size: usize,
    /// Upper bound on establishing the sender's connection
    pub connect_timeout: Duration,
    /// Optional progress callback
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            progress_callback: None,
        }
    }
}

/// Summary of a finished transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub transfer_id: Uuid,
    pub direction: TransferDirection,
    pub peer: SocketAddr,
    pub file_name: String,
    /// Source file on the sender, destination file on the receiver
    pub path: PathBuf,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn throughput_mbps(&self) -> f32 {
        throughput_mbps(self.bytes_transferred, self.elapsed)
    }
}

fn throughput_mbps(bytes: u64, elapsed: Duration) -> f32 {
    let secs = elapsed.as_secs_f32();
    if secs > 0.0 {
        (bytes as f32 / secs) / (1024.0 * 1024.0)
    } else {
        0.0
    }
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = fut => result,
    }
}

/// Point-to-point file transfer over one TCP connection per call.
///
/// A session never shares its connection: each send or receive opens,
/// owns and releases its own socket.
#[derive(Clone)]
pub struct FileTransferSession {
    config: FileTransferConfig,
}

impl FileTransferSession {
    pub fn new(config: FileTransferConfig) -> Self {
        if config.chunk_size == 0 {
            warn!("chunk_size must be positive, using {}", DEFAULT_CHUNK_SIZE);
            return Self {
                config: FileTransferConfig {
                    chunk_size: DEFAULT_CHUNK_SIZE,
                    ..config
                },
            };
        }
        Self { config }
    }

    pub fn config(&self) -> &FileTransferConfig {
        &self.config
    }

    fn report(&self, status: TransferStatus) {
        report(&self.config, status);
    }

    /// Send a file to `destination` on the configured port
    pub async fn send_file<P: AsRef<Path>>(
        &self,
        path: P,
        destination: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, TransferError> {
        self.send_file_to(path, SocketAddr::new(destination, self.config.port), cancel)
            .await
    }

    /// Send a file to an explicit socket address.
    ///
    /// Failures are logged and reported as `TransferStatus::Failed` before
    /// being returned; nothing escapes as a panic.
    pub async fn send_file_to<P: AsRef<Path>>(
        &self,
        path: P,
        target: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, TransferError> {
        let transfer_id = Uuid::new_v4();
        let path = path.as_ref();

        match self.send_inner(path, target, transfer_id, cancel).await {
            Ok(report) => {
                info!(
                    "File sent: {} -> {} ({} bytes, {:.2} MB/s)",
                    path.display(),
                    target,
                    report.bytes_transferred,
                    report.throughput_mbps()
                );
                Ok(report)
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!("Sending {} to {} cancelled", path.display(), target);
                } else {
                    error!("Failed to send {} to {}: {}", path.display(), target, e);
                }
                self.report(TransferStatus::Failed {
                    transfer_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn send_inner(
        &self,
        path: &Path,
        target: SocketAddr,
        transfer_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, TransferError> {
        let source_error = |source: io::Error| TransferError::SourceFile {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).await.map_err(source_error)?;
        let metadata = file.metadata().await.map_err(source_error)?;
        if !metadata.is_file() {
            return Err(source_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| source_error(io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")))?;
        let header = TransferMetadata::new(file_name.clone(), metadata.len());

        let connect = async {
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target)).await {
                Ok(Ok(socket)) => Ok(socket),
                Ok(Err(source)) => Err(TransferError::Connect { addr: target, source }),
                Err(_) => Err(TransferError::Connect {
                    addr: target,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                }),
            }
        };
        let mut socket = cancellable(cancel, connect).await?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        info!("Sending {} ({} bytes) to {}", file_name, header.file_size, target);

        cancellable(cancel, framing::write_metadata(&mut socket, &header)).await?;

        self.report(TransferStatus::Started {
            transfer_id,
            direction: TransferDirection::Send,
            file_name: file_name.clone(),
            file_size: header.file_size,
        });

        let started = Instant::now();
        let total = header.file_size;
        let mut source = file.take(total);
        let mut buffer = vec![0u8; self.config.chunk_size];
        let mut sent = 0u64;

        if total == 0 {
            self.report_progress(transfer_id, 0, 0);
        }

        while sent < total {
            let n = cancellable(cancel, async { source.read(&mut buffer).await.map_err(TransferError::from) }).await?;
            if n == 0 {
                // The file shrank after its size went on the wire
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source file ended after {} of {} bytes", sent, total),
                )));
            }

            cancellable(cancel, async { socket.write_all(&buffer[..n]).await.map_err(TransferError::from) }).await?;
            sent += n as u64;
            self.report_progress(transfer_id, sent, total);
        }

        cancellable(cancel, async { socket.shutdown().await.map_err(TransferError::from) }).await?;

        let elapsed = started.elapsed();
        self.report(TransferStatus::Completed {
            transfer_id,
            bytes_transferred: sent,
            elapsed_seconds: elapsed.as_secs_f32(),
            throughput_mbps: throughput_mbps(sent, elapsed),
        });

        Ok(TransferReport {
            transfer_id,
            direction: TransferDirection::Send,
            peer: target,
            file_name,
            path: path.to_path_buf(),
            bytes_transferred: sent,
            elapsed,
        })
    }

    fn report_progress(&self, transfer_id: Uuid, done: u64, total: u64) {
        report_progress(&self.config, transfer_id, done, total);
    }

    /// Bind the receiving socket without waiting for a peer yet
    pub async fn bind_receiver(&self) -> Result<PendingReceive, TransferError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransferError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!("Waiting for an incoming file on {}", local_addr);

        Ok(PendingReceive {
            listener,
            local_addr,
            config: self.config.clone(),
        })
    }

    /// Listen, accept one sender and store its file in `save_dir`.
    ///
    /// `save_dir` defaults to the current working directory.
    pub async fn receive_file(
        &self,
        save_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, TransferError> {
        self.bind_receiver().await?.receive(save_dir, cancel).await
    }
}

/// A bound listener waiting for exactly one sender.
///
/// Dropping it, or finishing `receive` by any path, closes the listener.
pub struct PendingReceive {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: FileTransferConfig,
}

impl PendingReceive {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn receive(
        self,
        save_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, TransferError> {
        let Self {
            listener,
            local_addr,
            config,
        } = self;

        let accepted = cancellable(cancel, async { listener.accept().await.map_err(TransferError::from) }).await;
        // Single-shot: stop listening before the content flows
        drop(listener);

        let (mut socket, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                if e.is_cancelled() {
                    info!("Stopped waiting for a file on {}", local_addr);
                } else {
                    error!("Failed to accept on {}: {}", local_addr, e);
                }
                return Err(e);
            }
        };
        info!("Incoming file transfer connection from {}", peer);

        let transfer_id = Uuid::new_v4();
        let result = receive_from(&mut socket, peer, save_dir, &config, transfer_id, cancel).await;

        match &result {
            Ok(report) => info!(
                "File received: {} ({} bytes, {:.2} MB/s)",
                report.path.display(),
                report.bytes_transferred,
                report.throughput_mbps()
            ),
            Err(e) => {
                if e.is_cancelled() {
                    info!("Receiving from {} cancelled", peer);
                } else {
                    error!("Error receiving file from {}: {}", peer, e);
                }
                report(
                    &config,
                    TransferStatus::Failed {
                        transfer_id,
                        error: e.to_string(),
                    },
                );
            }
        }

        result
    }
}

async fn receive_from(
    socket: &mut TcpStream,
    peer: SocketAddr,
    save_dir: Option<&Path>,
    config: &FileTransferConfig,
    transfer_id: Uuid,
    cancel: &CancellationToken,
) -> Result<TransferReport, TransferError> {
    let header = framing::read_metadata(socket, cancel).await?;
    let file_name = framing::sanitize_file_name(&header.file_name)?;
    if file_name != header.file_name {
        warn!("Sender name '{}' reduced to '{}'", header.file_name, file_name);
    }

    let dir = match save_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&dir).await?;
    let dest = dir.join(&file_name);

    info!("Receiving {} ({} bytes) into {}", file_name, header.file_size, dir.display());
    report(
        config,
        TransferStatus::Started {
            transfer_id,
            direction: TransferDirection::Receive,
            file_name: file_name.clone(),
            file_size: header.file_size,
        },
    );

    // Content lands in a sibling part file; `dest` is only touched once complete
    let part = dir.join(format!(".{}.{}.part", file_name, transfer_id.simple()));

    let started = Instant::now();
    let written = match write_content(socket, &part, header.file_size, config, transfer_id, cancel).await {
        Ok(()) => fs::rename(&part, &dest).await.map_err(TransferError::from),
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(rm) = fs::remove_file(&part).await {
            debug!("Could not remove partial file {}: {}", part.display(), rm);
        }
        return Err(e);
    }
    let elapsed = started.elapsed();

    report(
        config,
        TransferStatus::Completed {
            transfer_id,
            bytes_transferred: header.file_size,
            elapsed_seconds: elapsed.as_secs_f32(),
            throughput_mbps: throughput_mbps(header.file_size, elapsed),
        },
    );

    Ok(TransferReport {
        transfer_id,
        direction: TransferDirection::Receive,
        peer,
        file_name,
        path: dest,
        bytes_transferred: header.file_size,
        elapsed,
    })
}

/// Copy exactly `total` bytes from the socket into a fresh file at `path`
async fn write_content(
    socket: &mut TcpStream,
    path: &Path,
    total: u64,
    config: &FileTransferConfig,
    transfer_id: Uuid,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let mut file = File::create(path).await?;
    let mut buffer = vec![0u8; config.chunk_size];
    let mut received = 0u64;

    if total == 0 {
        report_progress(config, transfer_id, 0, 0);
    }

    while received < total {
        let want = (total - received).min(buffer.len() as u64) as usize;

        framing::read_exact(socket, &mut buffer[..want], cancel)
            .await
            .map_err(|e| match e {
                TransferError::Truncated { received: partial, .. } => TransferError::Truncated {
                    expected: total,
                    received: received + partial,
                },
                other => other,
            })?;

        file.write_all(&buffer[..want]).await?;
        received += want as u64;
        report_progress(config, transfer_id, received, total);
    }

    file.flush().await?;
    Ok(())
}

fn report(config: &FileTransferConfig, status: TransferStatus) {
    if let Some(callback) = &config.progress_callback {
        callback(status);
    }
}

fn report_progress(config: &FileTransferConfig, transfer_id: Uuid, done: u64, total: u64) {
    report(
        config,
        TransferStatus::Progress {
            transfer_id,
            bytes_transferred: done,
            total_bytes: total,
            percent_complete: framing::percent_complete(done, total),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records every status a session reports
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<TransferStatus>>>);

    impl Recorder {
        fn callback(&self) -> ProgressCallback {
            let events = self.0.clone();
            Arc::new(move |status: TransferStatus| events.lock().unwrap().push(status))
        }

        fn events(&self) -> Vec<TransferStatus> {
            self.0.lock().unwrap().clone()
        }

        fn progress(&self) -> Vec<(u64, u8)> {
            self.events()
                .into_iter()
                .filter_map(|status| match status {
                    TransferStatus::Progress {
                        bytes_transferred,
                        percent_complete,
                        ..
                    } => Some((bytes_transferred, percent_complete)),
                    _ => None,
                })
                .collect()
        }

        fn failed(&self) -> bool {
            self.events()
                .iter()
                .any(|status| matches!(status, TransferStatus::Failed { .. }))
        }
    }

    fn loopback_session(recorder: &Recorder) -> FileTransferSession {
        FileTransferSession::new(FileTransferConfig {
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            progress_callback: Some(recorder.callback()),
            ..FileTransferConfig::default()
        })
    }

    /// Run one receive in the background and one send in the foreground
    async fn transfer(
        source: &Path,
        save_dir: &Path,
    ) -> (Result<TransferReport, TransferError>, Result<TransferReport, TransferError>, Recorder, Recorder) {
        let send_events = Recorder::default();
        let recv_events = Recorder::default();

        let receiver = loopback_session(&recv_events);
        let pending = receiver.bind_receiver().await.unwrap();
        let target = pending.local_addr();

        let dir = save_dir.to_path_buf();
        let receiving = tokio::spawn(async move {
            pending.receive(Some(dir.as_path()), &CancellationToken::new()).await
        });

        let sender = loopback_session(&send_events);
        let sent = sender.send_file_to(source, target, &CancellationToken::new()).await;
        let received = receiving.await.unwrap();

        (sent, received, send_events, recv_events)
    }

    #[tokio::test]
    async fn test_loopback_transfer() {
        let _ = env_logger::builder().is_test(true).try_init();

        let send_dir = tempdir().unwrap();
        let receive_dir = tempdir().unwrap();

        let source = send_dir.path().join("test_file.dat");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let (sent, received, send_events, recv_events) = transfer(&source, receive_dir.path()).await;
        let sent = sent.unwrap();
        let received = received.unwrap();

        assert_eq!(sent.bytes_transferred, data.len() as u64);
        assert_eq!(received.bytes_transferred, data.len() as u64);
        assert_eq!(received.file_name, "test_file.dat");
        assert_eq!(std::fs::read(receive_dir.path().join("test_file.dat")).unwrap(), data);

        for events in [&send_events, &recv_events] {
            let progress = events.progress();
            assert_eq!(progress.last(), Some(&(data.len() as u64, 100)));
            assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
            assert!(events
                .events()
                .iter()
                .any(|status| matches!(status, TransferStatus::Completed { .. })));
        }
    }

    #[tokio::test]
    async fn test_empty_file() {
        let send_dir = tempdir().unwrap();
        let receive_dir = tempdir().unwrap();
        let source = send_dir.path().join("empty.txt");
        std::fs::write(&source, b"").unwrap();

        let (sent, received, _, recv_events) = transfer(&source, receive_dir.path()).await;
        sent.unwrap();
        let received = received.unwrap();

        let stored = receive_dir.path().join("empty.txt");
        assert_eq!(received.path, stored);
        assert_eq!(std::fs::metadata(&stored).unwrap().len(), 0);
        assert_eq!(recv_events.progress(), vec![(0, 100)]);
    }

    #[tokio::test]
    async fn test_one_chunk_plus_one_byte() {
        let send_dir = tempdir().unwrap();
        let receive_dir = tempdir().unwrap();
        let source = send_dir.path().join("chunky.bin");
        std::fs::write(&source, vec![7u8; DEFAULT_CHUNK_SIZE + 1]).unwrap();

        let (sent, received, _, recv_events) = transfer(&source, receive_dir.path()).await;
        sent.unwrap();
        received.unwrap();

        let progress = recv_events.progress();
        assert_eq!(
            progress,
            vec![(DEFAULT_CHUNK_SIZE as u64, 100), (DEFAULT_CHUNK_SIZE as u64 + 1, 100)]
        );
    }

    #[tokio::test]
    async fn test_receive_cancelled_while_waiting() {
        let recorder = Recorder::default();
        let session = loopback_session(&recorder);
        let pending = session.bind_receiver().await.unwrap();
        let addr = pending.local_addr();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = pending.receive(None, &cancel).await;
        let waited = started.elapsed();

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(waited >= Duration::from_millis(400));
        assert!(waited < Duration::from_secs(3));

        // The port is free again
        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let save_dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let session = loopback_session(&recorder);
        let pending = session.bind_receiver().await.unwrap();
        let target = pending.local_addr();

        let dir = save_dir.path().to_path_buf();
        let receiving = tokio::spawn(async move {
            pending.receive(Some(dir.as_path()), &CancellationToken::new()).await
        });

        let mut client = TcpStream::connect(target).await.unwrap();
        let header = TransferMetadata::new("short.bin", 100).encode().unwrap();
        client.write_all(&header).await.unwrap();
        client.write_all(&[1u8; 10]).await.unwrap();
        drop(client);

        match receiving.await.unwrap() {
            Err(TransferError::Truncated { expected, received }) => {
                assert_eq!(expected, 100);
                assert_eq!(received, 10);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
        assert!(recorder.failed());
        assert!(!save_dir.path().join("short.bin").exists());
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_failed_receive_keeps_existing_file() {
        let save_dir = tempdir().unwrap();
        let existing = save_dir.path().join("keep.txt");
        std::fs::write(&existing, b"precious user data").unwrap();

        let session = loopback_session(&Recorder::default());
        let pending = session.bind_receiver().await.unwrap();
        let target = pending.local_addr();

        let dir = save_dir.path().to_path_buf();
        let receiving = tokio::spawn(async move {
            pending.receive(Some(dir.as_path()), &CancellationToken::new()).await
        });

        let mut client = TcpStream::connect(target).await.unwrap();
        let header = TransferMetadata::new("keep.txt", 100).encode().unwrap();
        client.write_all(&header).await.unwrap();
        client.write_all(&[0u8; 10]).await.unwrap();
        drop(client);

        let result = receiving.await.unwrap();
        assert!(matches!(result, Err(TransferError::Truncated { .. })));
        assert_eq!(std::fs::read(&existing).unwrap(), b"precious user data");
        assert_eq!(entries(save_dir.path()), vec!["keep.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_receive_cancelled_during_content() {
        let save_dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let session = loopback_session(&recorder);
        let pending = session.bind_receiver().await.unwrap();
        let target = pending.local_addr();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let dir = save_dir.path().to_path_buf();
        let receiving = tokio::spawn(async move { pending.receive(Some(dir.as_path()), &token).await });

        let mut client = TcpStream::connect(target).await.unwrap();
        let header = TransferMetadata::new("slow.bin", 100).encode().unwrap();
        client.write_all(&header).await.unwrap();
        client.write_all(&[5u8; 10]).await.unwrap();

        // Wait until the header has been consumed and content is flowing
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder
            .events()
            .iter()
            .any(|status| matches!(status, TransferStatus::Started { .. }))
        {
            assert!(Instant::now() < deadline, "receiver never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        let result = receiving.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert!(recorder.failed());
        assert!(entries(save_dir.path()).is_empty());
        drop(client);
    }

    #[tokio::test]
    async fn test_send_cancelled_mid_stream() {
        let send_dir = tempdir().unwrap();
        let source = send_dir.path().join("big.bin");
        std::fs::write(&source, vec![1u8; DEFAULT_CHUNK_SIZE * 3]).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let draining = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });

        // Cancel as soon as the first chunk has gone out
        let cancel = CancellationToken::new();
        let recorder = Recorder::default();
        let record = recorder.callback();
        let token = cancel.clone();
        let callback: ProgressCallback = Arc::new(move |status: TransferStatus| {
            if matches!(status, TransferStatus::Progress { .. }) {
                token.cancel();
            }
            record(status);
        });
        let session = FileTransferSession::new(FileTransferConfig {
            progress_callback: Some(callback),
            ..FileTransferConfig::default()
        });

        let result = session.send_file_to(&source, target, &cancel).await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(recorder.progress(), vec![(DEFAULT_CHUNK_SIZE as u64, 33)]);
        assert!(recorder.failed());
        draining.await.unwrap();
    }

    #[tokio::test]
    async fn test_receiver_strips_directories() {
        let save_dir = tempdir().unwrap();
        let session = loopback_session(&Recorder::default());
        let pending = session.bind_receiver().await.unwrap();
        let target = pending.local_addr();

        let dir = save_dir.path().join("inbox");
        let inbox = dir.clone();
        let receiving = tokio::spawn(async move {
            pending.receive(Some(dir.as_path()), &CancellationToken::new()).await
        });

        let mut client = TcpStream::connect(target).await.unwrap();
        let header = TransferMetadata::new("../../escape.txt", 3).encode().unwrap();
        client.write_all(&header).await.unwrap();
        client.write_all(b"hey").await.unwrap();
        client.shutdown().await.unwrap();

        let report = receiving.await.unwrap().unwrap();
        assert_eq!(report.path, inbox.join("escape.txt"));
        assert_eq!(std::fs::read(inbox.join("escape.txt")).unwrap(), b"hey");
        assert!(!save_dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_send_to_closed_port_reports_failure() {
        let send_dir = tempdir().unwrap();
        let source = send_dir.path().join("doc.txt");
        std::fs::write(&source, b"content").unwrap();

        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let recorder = Recorder::default();
        let session = loopback_session(&recorder);
        let result = session.send_file_to(&source, unused, &CancellationToken::new()).await;

        assert!(matches!(result, Err(TransferError::Connect { .. })));
        assert!(recorder.failed());
    }

    #[tokio::test]
    async fn test_send_missing_file() {
        let dir = tempdir().unwrap();
        let session = loopback_session(&Recorder::default());

        let result = session
            .send_file_to(dir.path().join("nope.txt"), "127.0.0.1:9".parse().unwrap(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::SourceFile { .. })));

        let result = session
            .send_file_to(dir.path(), "127.0.0.1:9".parse().unwrap(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::SourceFile { .. })));
    }

    #[tokio::test]
    async fn test_send_cancelled_before_connect() {
        let send_dir = tempdir().unwrap();
        let source = send_dir.path().join("doc.txt");
        std::fs::write(&source, b"content").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let session = loopback_session(&Recorder::default());
        let result = session
            .send_file_to(&source, listener.local_addr().unwrap(), &cancel)
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_default_config() {
        let config = FileTransferConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.chunk_size, 8192);
    }
}
