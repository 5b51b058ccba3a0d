///! Cluster connection task
///!
///! One task owns the TCP stream and interprets [`transition`]'s states: it
///! connects, logs in, reads spots and waits out reconnect delays. Control
///! requests arrive on a channel. One that changes the state preempts whatever
///! the task is awaiting; one that doesn't leaves it running.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dxcluster_common::ConnectionState;

use super::backoff::Backoff;
use super::state::{ConnectionEvent, transition};
use super::stats::StatsTracker;
use crate::config::{BackoffConfig, ClusterConfig};
use crate::error::ClusterError;
use crate::module::spot::codec::is_login_prompt;
use crate::module::spot::{LineBuffer, SpotPipeline, parse_spot};

const READ_CHUNK: usize = 4096;
const LINE_TERMINATOR: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Start,
    Stop,
    Restart,
}

impl Control {
    fn event(self) -> ConnectionEvent {
        match self {
            Control::Start => ConnectionEvent::StartRequested,
            Control::Stop => ConnectionEvent::StopRequested,
            Control::Restart => ConnectionEvent::RestartRequested,
        }
    }
}

type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// Control surface of the running connection task.
pub struct ClusterHandle {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<ConnectionState>,
    writer: SharedWriter,
    write_timeout: Duration,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClusterHandle {
    pub fn start(&self) {
        self.send_control(Control::Start);
    }

    pub fn stop(&self) {
        self.send_control(Control::Stop);
    }

    /// Drop the current connection (or skip a pending reconnect delay) and
    /// connect again.
    pub fn restart(&self) {
        self.send_control(Control::Restart);
    }

    fn send_control(&self, control: Control) {
        if self.control.send(control).is_err() {
            warn!("Cluster connection task is gone, ignoring {:?}", control);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Write one command line to the node. Only allowed while `Connected`.
    ///
    /// A write that stalls past the write timeout drops the socket and
    /// restarts the connection.
    pub async fn send_line(&self, text: &str) -> Result<(), ClusterError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClusterError::EmptyCommand);
        }
        if text.chars().any(char::is_control) {
            return Err(ClusterError::InvalidCommand);
        }
        if self.state() != ConnectionState::Connected {
            return Err(ClusterError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(ClusterError::NotConnected)?;
        let written = tokio::time::timeout(self.write_timeout, write_terminated(stream, text)).await;
        match written {
            Ok(written) => written?,
            Err(_) => {
                // Part of the line may be on the wire already
                *writer = None;
                drop(writer);
                warn!("Write to cluster stalled for {:?}, reconnecting", self.write_timeout);
                self.restart();
                return Err(ClusterError::WriteTimeout(self.write_timeout));
            }
        }
        info!("Sent to cluster: {}", text);
        Ok(())
    }

    /// Stop the task for good, waiting briefly for it to close the socket.
    pub async fn shutdown(&self) {
        self.stop();

        let mut state = self.subscribe();
        let stopped = matches!(
            tokio::time::timeout(
                Duration::from_secs(2),
                state.wait_for(|s| *s == ConnectionState::Disconnected),
            )
            .await,
            Ok(Ok(_))
        );
        if !stopped {
            debug!("Connection task did not confirm stop, aborting it");
        }

        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        self.writer.lock().await.take();
    }
}

pub struct ClusterConnection {
    config: ClusterConfig,
    backoff: Backoff,
    pipeline: Arc<SpotPipeline>,
    stats: Arc<StatsTracker>,
    state_tx: watch::Sender<ConnectionState>,
    writer: SharedWriter,
    reader: Option<OwnedReadHalf>,
    buffer: LineBuffer,
    connected_at: Option<Instant>,
    last_received: Option<DateTime<Utc>>,
}

impl ClusterConnection {
    /// Spawn the connection task in `Disconnected`; call [`ClusterHandle::start`] to connect.
    pub fn spawn(
        config: ClusterConfig,
        backoff: &BackoffConfig,
        pipeline: Arc<SpotPipeline>,
        stats: Arc<StatsTracker>,
    ) -> ClusterHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let writer: SharedWriter = Arc::new(Mutex::new(None));
        let write_timeout = Duration::from_secs(config.write_timeout_secs.max(1));

        let connection = Self {
            config,
            backoff: Backoff::from_config(backoff),
            pipeline,
            stats,
            state_tx,
            writer: writer.clone(),
            reader: None,
            buffer: LineBuffer::new(),
            connected_at: None,
            last_received: None,
        };
        let task = tokio::spawn(connection.run(control_rx));

        ClusterHandle {
            control: control_tx,
            state: state_rx,
            writer,
            write_timeout,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut state = ConnectionState::Disconnected;
        while let Some(event) = self.next_event(state, &mut control).await {
            state = self.apply(state, event).await;
        }

        self.close().await;
        debug!("Cluster connection task finished");
    }

    /// Run the step for `state` until it finishes or a control request moves
    /// the state elsewhere. `None` once every handle is gone.
    async fn next_event(
        &mut self,
        state: ConnectionState,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Option<ConnectionEvent> {
        let step = self.step(state);
        tokio::pin!(step);

        loop {
            tokio::select! {
                biased;
                request = control.recv() => {
                    let event = request?.event();
                    if transition(state, event).state != state {
                        return Some(event);
                    }
                    debug!("Ignoring {:?} while {}", event, state);
                }
                event = &mut step => return Some(event),
            }
        }
    }

    /// Perform the I/O for `state` and report what happened.
    async fn step(&mut self, state: ConnectionState) -> ConnectionEvent {
        match state {
            ConnectionState::Disconnected => std::future::pending().await,
            ConnectionState::Connecting => match self.connect().await {
                Ok(()) => ConnectionEvent::ConnectOk,
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.config.address(), e);
                    ConnectionEvent::ConnectFailed
                }
            },
            ConnectionState::AwaitingLogin => match self.login().await {
                Ok(()) => ConnectionEvent::LoginComplete,
                Err(e) => {
                    warn!("Login to {} failed: {}", self.config.address(), e);
                    ConnectionEvent::IoError
                }
            },
            ConnectionState::Connected => match self.receive().await {
                Ok(()) => ConnectionEvent::LineReceived,
                Err(e) => {
                    warn!("Cluster connection lost: {}", e);
                    ConnectionEvent::IoError
                }
            },
            ConnectionState::Reconnecting => {
                let delay = self.backoff.next_delay();
                info!("Reconnecting to {} in {:.1}s", self.config.address(), delay.as_secs_f64());
                tokio::time::sleep(delay).await;
                ConnectionEvent::TimerFired
            }
        }
    }

    async fn apply(&mut self, from: ConnectionState, event: ConnectionEvent) -> ConnectionState {
        let next = transition(from, event);
        if next.state == from {
            return from;
        }

        if from == ConnectionState::Connected {
            if let Some(connected_at) = self.connected_at.take() {
                self.backoff.connection_lasted(connected_at.elapsed());
            }
        }
        if next.reset_backoff {
            self.backoff.reset();
        }
        if !matches!(next.state, ConnectionState::AwaitingLogin | ConnectionState::Connected) {
            self.close().await;
        }
        if next.reconnect_attempt {
            self.stats.record_reconnect_attempt().await;
        }
        if next.state == ConnectionState::Connected {
            self.connected_at = Some(Instant::now());
        }

        self.stats.set_state(next.state).await;
        self.state_tx.send_replace(next.state);
        info!("Cluster connection: {} -> {} ({:?})", from, next.state, event);
        next.state
    }

    async fn connect(&mut self) -> Result<(), ClusterError> {
        let address = self.config.address();
        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
        info!("Connecting to {}", address);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ClusterError::ConnectTimeout {
                address: address.clone(),
                timeout,
            })??;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.buffer.clear();
        *self.writer.lock().await = Some(writer);
        info!("Connected to {}, waiting for login prompt", address);
        Ok(())
    }

    /// Answer the login prompt, then wait for the node to start talking.
    ///
    /// Nodes that never prompt are used anonymously after `login_timeout_secs`.
    async fn login(&mut self) -> Result<(), ClusterError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.login_timeout_secs);
        let mut prompted = false;

        while !prompted {
            while let Some(line) = self.buffer.next_line() {
                if is_login_prompt(&line) {
                    prompted = true;
                } else if !line.trim().is_empty() {
                    debug!("Banner: {}", line);
                }
            }
            if prompted || is_login_prompt(&self.buffer.partial()) {
                prompted = true;
                break;
            }
            match tokio::time::timeout_at(deadline, self.read_chunk()).await {
                Ok(read) => read?,
                Err(_) => break,
            }
        }

        if !prompted {
            info!("No login prompt within {}s, proceeding anyway", self.config.login_timeout_secs);
            return Ok(());
        }

        self.buffer.clear();
        info!("Login prompt received, sending callsign {}", self.config.callsign);
        self.write_line(&self.config.callsign).await?;

        let grace = Instant::now() + Duration::from_secs(self.config.login_grace_secs);
        while !self.buffer.has_line() {
            match tokio::time::timeout_at(grace, self.read_chunk()).await {
                Ok(read) => read?,
                Err(_) => break,
            }
        }

        for command in &self.config.initial_commands {
            self.write_line(command).await?;
        }
        Ok(())
    }

    /// Read once and ingest every complete line.
    async fn receive(&mut self) -> Result<(), ClusterError> {
        let timeout = Duration::from_secs(self.config.read_timeout_secs.max(1));
        tokio::time::timeout(timeout, self.read_chunk())
            .await
            .map_err(|_| ClusterError::ReadTimeout(timeout))??;

        while let Some(line) = self.buffer.next_line() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_spot(&line, self.receipt_time()) {
                Ok(spot) => {
                    debug!("Spot: {} {} by {}", spot.frequency, spot.dx_callsign, spot.spotter_callsign);
                    self.pipeline.ingest(spot).await;
                    self.stats.record_spot().await;
                }
                Err(e) => {
                    debug!("Ignoring line ({}): {}", e, line);
                    self.stats.record_parse_failure().await;
                }
            }
        }
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<(), ClusterError> {
        let reader = self.reader.as_mut().ok_or(ClusterError::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK];
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Err(ClusterError::Closed);
        }
        self.buffer.push(&chunk[..read]);
        Ok(())
    }

    async fn write_line(&self, text: &str) -> Result<(), ClusterError> {
        let timeout = Duration::from_secs(self.config.write_timeout_secs.max(1));
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(ClusterError::NotConnected)?;
        tokio::time::timeout(timeout, write_terminated(stream, text))
            .await
            .map_err(|_| ClusterError::WriteTimeout(timeout))??;
        debug!("Sent: {}", text);
        Ok(())
    }

    /// Wall-clock receipt time, never earlier than the previous line's.
    fn receipt_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_received {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_received = Some(at);
        at
    }

    async fn close(&mut self) {
        self.reader = None;
        self.buffer.clear();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

async fn write_terminated(stream: &mut OwnedWriteHalf, text: &str) -> std::io::Result<()> {
    stream.write_all(format!("{}{}", text, LINE_TERMINATOR).as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::spot::SpotCache;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn config(port: u16) -> ClusterConfig {
        ClusterConfig {
            host: "127.0.0.1".to_string(),
            port,
            callsign: "CS8ABG".to_string(),
            connect_timeout_secs: 2,
            write_timeout_secs: 2,
            login_timeout_secs: 2,
            login_grace_secs: 1,
            read_timeout_secs: 30,
            initial_commands: vec![],
        }
    }

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            min_delay_ms: 50,
            max_delay_ms: 200,
            stable_after_secs: 60,
        }
    }

    async fn wait_for(handle: &ClusterHandle, state: ConnectionState) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_then_ingest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let node = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();

            write.write_all(b"Welcome to TEST node\r\nlogin: ").await.unwrap();
            let call = lines.next_line().await.unwrap().unwrap().trim().to_string();
            write.write_all(b"Hello CS8ABG\r\n").await.unwrap();
            write
                .write_all(b"DX de K1ABC:     14074.0  DL1XYZ       FT8 -12 dB             1234Z\r\n")
                .await
                .unwrap();
            write.write_all(b"not a spot at all\r\n").await.unwrap();
            let command = lines.next_line().await.unwrap().unwrap().trim().to_string();
            (call, command)
        });

        let cache = Arc::new(SpotCache::new(10));
        let stats = Arc::new(StatsTracker::new());
        let handle = ClusterConnection::spawn(
            config(port),
            &backoff(),
            Arc::new(SpotPipeline::new(cache.clone())),
            stats.clone(),
        );
        assert!(matches!(handle.send_line("sh/dx").await, Err(ClusterError::NotConnected)));

        handle.start();
        wait_for(&handle, ConnectionState::Connected).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            // "Hello CS8ABG" and the junk line
            while stats.snapshot(0, None).await.total_parse_failures < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(handle.send_line("  ").await, Err(ClusterError::EmptyCommand)));
        handle.send_line("sh/wwv").await.unwrap();

        let (call, command) = node.await.unwrap();
        assert_eq!(call, "CS8ABG");
        assert_eq!(command, "sh/wwv");

        let spots = cache.all().await;
        assert_eq!(spots.len(), 1);
        assert_eq!(spots[0].dx_callsign, "DL1XYZ");
        let snapshot = stats.snapshot(cache.len().await, None).await;
        assert_eq!(snapshot.total_spots_received, 1);
        assert_eq!(snapshot.total_parse_failures, 2);

        handle.shutdown().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connection_keeps_retrying() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let stats = Arc::new(StatsTracker::new());
        let handle = ClusterConnection::spawn(
            config(port),
            &backoff(),
            Arc::new(SpotPipeline::new(Arc::new(SpotCache::new(10)))),
            stats.clone(),
        );
        handle.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.snapshot(0, None).await.reconnect_count < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.stop();
        wait_for(&handle, ConnectionState::Disconnected).await;
        let count = stats.snapshot(0, None).await.reconnect_count;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(stats.snapshot(0, None).await.reconnect_count, count);
    }

    /// Accepts every connection, answers the login and then stops reading.
    /// Each accepted login is reported on the returned channel.
    fn silent_node(listener: TcpListener) -> mpsc::UnboundedReceiver<()> {
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                if write.write_all(b"login: ").await.is_err() {
                    continue;
                }
                let _ = lines.next_line().await;
                let _ = write.write_all(b"Hello CS8ABG\r\n").await;
                held.push((lines, write));
                let _ = accepted_tx.send(());
            }
        });
        accepted
    }

    #[tokio::test]
    async fn test_repeated_start_does_not_stall_reconnects() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let stats = Arc::new(StatsTracker::new());
        let handle = ClusterConnection::spawn(
            config(port),
            &backoff(),
            Arc::new(SpotPipeline::new(Arc::new(SpotCache::new(10)))),
            stats.clone(),
        );
        handle.start();
        wait_for(&handle, ConnectionState::Reconnecting).await;

        let before = stats.snapshot(0, None).await.reconnect_count;
        let until = Instant::now() + Duration::from_secs(1);
        while Instant::now() < until {
            handle.start();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        let attempts = stats.snapshot(0, None).await.reconnect_count - before;
        assert!(attempts >= 2, "only {} reconnect attempts in 1s", attempts);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_skips_a_long_reconnect_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stats = Arc::new(StatsTracker::new());
        let slow = BackoffConfig {
            min_delay_ms: 30_000,
            max_delay_ms: 60_000,
            stable_after_secs: 60,
        };
        let handle = ClusterConnection::spawn(
            config(port),
            &slow,
            Arc::new(SpotPipeline::new(Arc::new(SpotCache::new(10)))),
            stats.clone(),
        );
        handle.start();
        wait_for(&handle, ConnectionState::Reconnecting).await;

        // The node comes up during the delay
        let mut accepted = silent_node(TcpListener::bind(("127.0.0.1", port)).await.unwrap());

        let restarted_at = Instant::now();
        handle.restart();
        wait_for(&handle, ConnectionState::Connected).await;
        accepted.recv().await.unwrap();
        assert!(restarted_at.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.snapshot(0, None).await.reconnect_count, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut accepted = silent_node(listener);

        let mut config = config(port);
        config.write_timeout_secs = 1;
        let stats = Arc::new(StatsTracker::new());
        let handle = ClusterConnection::spawn(
            config,
            &backoff(),
            Arc::new(SpotPipeline::new(Arc::new(SpotCache::new(10)))),
            stats.clone(),
        );
        handle.start();
        accepted.recv().await.unwrap();
        wait_for(&handle, ConnectionState::Connected).await;

        // Far more than the socket buffers hold while nobody reads
        let flood = "x".repeat(64 * 1024 * 1024);
        let started = Instant::now();
        assert!(matches!(
            handle.send_line(&flood).await,
            Err(ClusterError::WriteTimeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));

        tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .expect("reconnected in time")
            .unwrap();
        wait_for(&handle, ConnectionState::Connected).await;
        assert_eq!(stats.snapshot(0, None).await.reconnect_count, 1);

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown not blocked by the writer");
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_control_characters_are_rejected() {
        let handle = ClusterConnection::spawn(
            config(1),
            &backoff(),
            Arc::new(SpotPipeline::new(Arc::new(SpotCache::new(10)))),
            Arc::new(StatsTracker::new()),
        );
        assert!(matches!(
            handle.send_line("sh/dx\r\nbye").await,
            Err(ClusterError::InvalidCommand)
        ));
        handle.shutdown().await;
    }
}
