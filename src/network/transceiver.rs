//! UDP transceiver
//!
//! Owns a non-blocking datagram socket, runs one background task that turns
//! inbound frames into telemetry records, and offers a synchronous send path.
//!
//! The receive task reads through tokio's reactor. Sends go through a
//! non-blocking clone of the same socket, so every `send` is exactly one
//! `sendto` call regardless of what the reactor has observed so far.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::TransceiverConfig;
use crate::protocol::{frame, response, TelemetryRecord, FRAME_SIZE};

/// Receive buffer; larger than a frame so oversized datagrams are seen whole
const RECV_BUFFER_SIZE: usize = 1024;

/// Transceiver errors
#[derive(Error, Debug)]
pub enum TransceiverError {
    #[error("Socket initialization failed: {0}")]
    SocketInit(String),

    #[error("Transceiver already running")]
    AlreadyRunning,
}

pub type TransceiverResult<T> = Result<T, TransceiverError>;

/// Callback fired on the receive task for every decoded record
pub type RecordCallback = Arc<dyn Fn(TelemetryRecord) + Send + Sync>;

/// Transceiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverState {
    Idle,
    Connecting,
    Listening,
}

/// Link counters, shared with the receive task
#[derive(Debug, Default)]
struct LinkCounters {
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    records_received: AtomicU64,
    datagrams_dropped: AtomicU64,
    receive_errors: AtomicU64,
}

/// Link statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkStats {
    /// Frames fully accepted by the socket
    pub frames_sent: u64,
    /// Sends that failed or were short
    pub send_failures: u64,
    /// Records decoded and handed to the callback
    pub records_received: u64,
    /// Datagrams that were not frames or carried undecodable bodies
    pub datagrams_dropped: u64,
    /// I/O errors seen by the receive loop
    pub receive_errors: u64,
}

impl LinkCounters {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Live socket and receive task
struct Session {
    /// Non-blocking handle used by `send`; shares the bound port with the receiver
    sender: std::net::UdpSocket,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// UDP transceiver.
///
/// Dropping a running transceiver closes the shutdown channel, which also
/// ends the receive task.
pub struct Transceiver {
    config: TransceiverConfig,
    state: TransceiverState,
    callback: Option<RecordCallback>,
    session: Option<Session>,
    counters: Arc<LinkCounters>,
}

impl Transceiver {
    /// Create a new, idle transceiver
    pub fn new(config: TransceiverConfig) -> Self {
        Self {
            config,
            state: TransceiverState::Idle,
            callback: None,
            session: None,
            counters: Arc::new(LinkCounters::default()),
        }
    }

    /// Create an idle transceiver with its record callback already in place
    pub fn with_callback<F>(config: TransceiverConfig, callback: F) -> Self
    where
        F: Fn(TelemetryRecord) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
            ..Self::new(config)
        }
    }

    /// Register the record callback. Only allowed while idle.
    pub fn subscribe<F>(&mut self, callback: F) -> TransceiverResult<()>
    where
        F: Fn(TelemetryRecord) + Send + Sync + 'static,
    {
        if self.session.is_some() {
            return Err(TransceiverError::AlreadyRunning);
        }
        self.callback = Some(Arc::new(callback));
        Ok(())
    }

    /// Bind `0.0.0.0:local_port` and start the receive task.
    ///
    /// On failure no task is spawned and the transceiver stays idle.
    pub async fn start(&mut self, remote_addr: SocketAddr, local_port: u16) -> TransceiverResult<()> {
        if self.session.is_some() {
            return Err(TransceiverError::AlreadyRunning);
        }

        self.state = TransceiverState::Connecting;

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], local_port));
        let (socket, sender, local_addr) = match open_socket(bind_addr) {
            Ok(parts) => parts,
            Err(e) => {
                self.state = TransceiverState::Idle;
                tracing::error!("Failed to bind {}: {}", bind_addr, e);
                return Err(TransceiverError::SocketInit(format!(
                    "Failed to bind to {}: {}",
                    bind_addr, e
                )));
            }
        };

        tracing::info!(
            "Listening for telemetry on {}, sending to {}",
            local_addr,
            remote_addr
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(receive_loop(
            socket,
            shutdown_rx,
            self.callback.clone(),
            self.counters.clone(),
            self.config.clone(),
        ));

        self.session = Some(Session {
            sender,
            remote_addr,
            local_addr,
            shutdown_tx,
            task,
        });
        self.state = TransceiverState::Listening;

        Ok(())
    }

    /// Send one 32-byte frame.
    ///
    /// A single non-blocking send; anything other than all 32 bytes being
    /// accepted counts as failure. No retry.
    pub fn send(&self, frame: &[u8]) -> bool {
        if frame.len() != FRAME_SIZE {
            tracing::error!(
                "Refusing to send {} byte frame (expected {})",
                frame.len(),
                FRAME_SIZE
            );
            return false;
        }

        let Some(session) = &self.session else {
            tracing::warn!("Cannot send: transceiver not running");
            return false;
        };

        match session.sender.send_to(frame, session.remote_addr) {
            Ok(sent) if sent == FRAME_SIZE => {
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Sent frame to {}: {}", session.remote_addr, response::hex_dump(frame));
                true
            }
            Ok(sent) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Short send to {}: {} of {} bytes", session.remote_addr, sent, FRAME_SIZE);
                false
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Send to {} failed: {}", session.remote_addr, e);
                false
            }
        }
    }

    /// Wrap a body and send it
    pub fn send_body(&self, body: &[u8]) -> bool {
        match frame::wrap(body) {
            Ok(frame) => self.send(&frame),
            Err(e) => {
                tracing::error!("Cannot frame body: {}", e);
                false
            }
        }
    }

    /// Stop the receive task and release the socket. No-op when idle.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let _ = session.shutdown_tx.try_send(());

        let mut task = session.task;
        match tokio::time::timeout(self.config.join_timeout(), &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Receive task ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Receive task did not stop within {:?}, aborting",
                    self.config.join_timeout()
                );
                task.abort();
            }
        }

        drop(session.sender);
        self.state = TransceiverState::Idle;
        tracing::info!("Transceiver stopped ({})", session.local_addr);
    }

    pub fn state(&self) -> TransceiverState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state == TransceiverState::Listening
    }

    /// Bound local address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.local_addr)
    }

    /// Remote address while listening
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.remote_addr)
    }

    pub fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }
}

impl Default for Transceiver {
    fn default() -> Self {
        Self::new(TransceiverConfig::default())
    }
}

/// Bind a non-blocking socket and split it into the reactor-driven receiver
/// and a plain sender handle.
fn open_socket(
    bind_addr: SocketAddr,
) -> std::io::Result<(UdpSocket, std::net::UdpSocket, SocketAddr)> {
    let std_socket = std::net::UdpSocket::bind(bind_addr)?;
    std_socket.set_nonblocking(true)?;
    let local_addr = std_socket.local_addr()?;
    let sender = std_socket.try_clone()?;
    let socket = UdpSocket::from_std(std_socket)?;
    Ok((socket, sender, local_addr))
}

/// Background receive loop. Exits only on shutdown.
async fn receive_loop(
    socket: UdpSocket,
    mut shutdown_rx: mpsc::Receiver<()>,
    callback: Option<RecordCallback>,
    counters: Arc<LinkCounters>,
    config: TransceiverConfig,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                tracing::debug!("Receive loop shutting down");
                break;
            }

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        handle_datagram(&buf[..len], from, callback.as_ref(), &counters);
                    }
                    Err(e) => {
                        counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Receive error: {}", e);
                        tokio::time::sleep(config.poll_interval()).await;
                    }
                }
            }
        }
    }
}

fn handle_datagram(
    datagram: &[u8],
    from: SocketAddr,
    callback: Option<&RecordCallback>,
    counters: &LinkCounters,
) {
    if datagram.len() != FRAME_SIZE {
        counters.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Ignoring {} byte datagram from {}", datagram.len(), from);
        return;
    }

    let Some(body) = frame::unwrap(datagram) else {
        counters.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let Some(record) = response::process(&body) else {
        counters.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    counters.records_received.fetch_add(1, Ordering::Relaxed);

    if let Some(callback) = callback {
        callback(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{payload, RawFrame, Telemetry};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn loopback(addr: SocketAddr) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    }

    async fn started_with_channel(
        remote: SocketAddr,
    ) -> (Transceiver, mpsc::UnboundedReceiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transceiver = Transceiver::with_callback(TransceiverConfig::default(), move |record| {
            let _ = tx.send(record);
        });
        transceiver.start(remote, 0).await.unwrap();
        (transceiver, rx)
    }

    fn status_frame(address: u8) -> RawFrame {
        let body = payload::encode(address, false, 0x04, &[1.0, 2.0, 3.0, 4.0, 0.0, 1.0]);
        frame::wrap(&body).unwrap()
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut transceiver = Transceiver::default();
        transceiver.stop().await;
        transceiver.stop().await;
        assert_eq!(transceiver.state(), TransceiverState::Idle);
    }

    #[tokio::test]
    async fn test_receives_valid_frame() {
        let device = peer().await;
        let (mut transceiver, mut rx) = started_with_channel(device.local_addr().unwrap()).await;
        assert!(transceiver.is_listening());

        let target = loopback(transceiver.local_addr().unwrap());
        device.send_to(&status_frame(3), target).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.address, 3);
        assert!(matches!(record.data, Telemetry::Status { state: 1, .. }));

        transceiver.stop().await;
        assert_eq!(transceiver.state(), TransceiverState::Idle);
    }

    #[tokio::test]
    async fn test_garbage_is_dropped_and_loop_survives() {
        let device = peer().await;
        let (mut transceiver, mut rx) = started_with_channel(device.local_addr().unwrap()).await;
        let target = loopback(transceiver.local_addr().unwrap());

        // Correct header, wrong checksum
        let mut bad = status_frame(1);
        bad[31] = bad[31].wrapping_add(1);
        device.send_to(&bad, target).await.unwrap();

        // Stray traffic of the wrong size
        device.send_to(b"hello", target).await.unwrap();
        device.send_to(&[0u8; 64], target).await.unwrap();

        device.send_to(&status_frame(2), target).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.address, 2);
        assert!(rx.try_recv().is_err());

        let stats = transceiver.stats();
        assert_eq!(stats.records_received, 1);
        assert_eq!(stats.datagrams_dropped, 3);

        transceiver.stop().await;
    }

    #[tokio::test]
    async fn test_send_reaches_remote() {
        let device = peer().await;
        let (mut transceiver, _rx) = started_with_channel(device.local_addr().unwrap()).await;

        let frame = frame::wrap(&payload::motor_speed(3, 512.0)).unwrap();
        assert!(transceiver.send(&frame));

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &frame);
        assert_eq!(transceiver.stats().frames_sent, 1);

        transceiver.stop().await;
    }

    #[tokio::test]
    async fn test_first_send_right_after_start() {
        let device = peer().await;
        let mut transceiver = Transceiver::default();
        transceiver.start(device.local_addr().unwrap(), 0).await.unwrap();
        assert!(transceiver.send_body(&payload::motor_start(1)));

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame::unwrap(&buf[..len]), Some(payload::motor_start(1)));

        transceiver.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fresh_links_send_immediately_on_multi_thread_runtime() {
        let device = peer().await;
        let remote = device.local_addr().unwrap();

        for _ in 0..20 {
            let mut transceiver = Transceiver::default();
            transceiver.start(remote, 0).await.unwrap();
            assert!(transceiver.send_body(&payload::motor_stop(2)));
            transceiver.stop().await;
        }

        let mut buf = [0u8; 64];
        for _ in 0..20 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), device.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(len, FRAME_SIZE);
        }
    }

    #[tokio::test]
    async fn test_send_rejects_wrong_length() {
        let device = peer().await;
        let (mut transceiver, _rx) = started_with_channel(device.local_addr().unwrap()).await;

        assert!(!transceiver.send(&[0u8; 31]));
        assert!(!transceiver.send(&[0u8; 33]));
        assert_eq!(transceiver.stats().frames_sent, 0);

        transceiver.stop().await;
    }

    #[tokio::test]
    async fn test_send_when_idle_fails() {
        let transceiver = Transceiver::default();
        let frame = frame::wrap(&payload::motor_stop(1)).unwrap();
        assert!(!transceiver.send(&frame));
        assert!(!transceiver.send_body(&payload::motor_stop(1)));
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_idle() {
        let occupied = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut transceiver = Transceiver::default();
        let result = transceiver.start("127.0.0.1:9000".parse().unwrap(), port).await;

        assert!(matches!(result, Err(TransceiverError::SocketInit(_))));
        assert_eq!(transceiver.state(), TransceiverState::Idle);
        assert!(transceiver.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_double_start_and_late_subscribe_rejected() {
        let device = peer().await;
        let remote = device.local_addr().unwrap();
        let (mut transceiver, _rx) = started_with_channel(remote).await;

        assert_err!(transceiver.start(remote, 0).await);
        assert_err!(transceiver.subscribe(|_| {}));

        transceiver.stop().await;
        assert_ok!(transceiver.subscribe(|_| {}));
        assert_ok!(transceiver.start(remote, 0).await);
        transceiver.stop().await;
    }
}
