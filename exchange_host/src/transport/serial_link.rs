//! The shared serial channel to the coin/sorter microcontroller.
//!
//! One [`SerialLinkTask`] owns the stream and runs the reader loop; any
//! number of cloneable [`SerialLink`] handles submit commands over an mpsc
//! channel with oneshot response pairing, the reference transport's actor
//! shape. Inbound asynchronous events fan out over a broadcast channel in
//! FIFO order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use derive_builder::Builder;
use exchange_core::kiosk::{parse_line, sort_verdict, HostCommand, McuMessage, ParseError};
use exchange_core::{BillDenom, CoinDenom};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::inventory::Inventory;
use crate::transport::backoff::BackoffPolicy;

/// Device the bridge exposes as a stream socket (9600 8N1 on the wire).
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The link task is gone; no command can be delivered.
    #[error("link closed")]
    Closed,
    /// The serial device is not currently open.
    #[error("not connected")]
    NotConnected,
    /// No acknowledgement arrived within the response budget.
    #[error("timeout waiting for acknowledgement")]
    Timeout,
    /// The connection dropped while the command was in flight.
    #[error("connection lost")]
    Disconnected,
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Asynchronous traffic from the microcontroller, fanned out to every
/// subscriber in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A coin was validated. The coin inventory is already credited when
    /// subscribers observe this.
    Coin { denom: CoinDenom },
    DispenseAck { echo: String },
    /// The coin module finished paying out. The coin inventory is already
    /// debited when subscribers observe this.
    DispenseDone { denom: u32, qty: u32 },
    SortDone { denom: u32 },
    Firmware(FirmwareStatus),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStatus {
    Ready,
    Homing,
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct LinkConfig {
    #[builder(default = "DEFAULT_PORT.to_string()")]
    pub socket_path: String,
    #[builder(default = "Duration::from_secs(2)")]
    pub ack_timeout: Duration,
    #[builder(default = "Duration::from_secs(60)")]
    pub sort_timeout: Duration,
    #[builder(default)]
    pub backoff: BackoffPolicy,
    #[builder(default = "16")]
    pub request_capacity: usize,
    #[builder(default = "64")]
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfigBuilder::default()
            .build()
            .expect("builder defaults are complete")
    }
}

enum LinkRequest {
    /// A command whose completion is its `ACK:<echo>` line.
    Command {
        command: HostCommand,
        respond_to: oneshot::Sender<LinkResult<()>>,
    },
    /// A sort, resolved by the firmware's OK / error verdict.
    Sort {
        denom: u32,
        respond_to: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to the link task.
#[derive(Clone)]
pub struct SerialLink {
    requests: mpsc::Sender<LinkRequest>,
    events: broadcast::Sender<LinkEvent>,
    session_open: Arc<AtomicBool>,
    sort_gate: Arc<AsyncMutex<()>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    ack_timeout: Duration,
    sort_timeout: Duration,
}

impl SerialLink {
    /// Creates a handle/task pair. Spawn [`SerialLinkTask::run`] to bring
    /// the link up.
    #[must_use]
    pub fn channel(config: LinkConfig, coins: Inventory) -> (SerialLink, SerialLinkTask) {
        let (requests_tx, requests_rx) = mpsc::channel(config.request_capacity);
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let session_open = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let handle = SerialLink {
            requests: requests_tx,
            events: events_tx.clone(),
            session_open: Arc::clone(&session_open),
            sort_gate: Arc::new(AsyncMutex::new(())),
            running: Arc::clone(&running),
            shutdown: Arc::clone(&shutdown),
            ack_timeout: config.ack_timeout,
            sort_timeout: config.sort_timeout,
        };
        let task = SerialLinkTask {
            config,
            requests: requests_rx,
            events: events_tx,
            coins,
            session_open,
            running,
            shutdown,
            pending_acks: Vec::new(),
            pending_sort: None,
        };
        (handle, task)
    }

    /// Subscribes to inbound events. Subscribe before enabling the coin
    /// acceptor to see every coin of a session.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub async fn enable_coin(&self) -> LinkResult<()> {
        self.command(HostCommand::EnableCoin).await
    }

    pub async fn disable_coin(&self) -> LinkResult<()> {
        self.command(HostCommand::DisableCoin).await
    }

    /// Asks the coin module to pay out `qty` coins of `denom`. Returns
    /// once the command is acknowledged; completion arrives later as a
    /// [`LinkEvent::DispenseDone`].
    pub async fn dispense_coins(&self, denom: CoinDenom, qty: u32) -> LinkResult<()> {
        self.command(HostCommand::Dispense {
            denom: denom.value(),
            qty,
        })
        .await
    }

    /// Routes the bill held by the sorter and waits for the verdict.
    ///
    /// At most one sort is in flight at a time. While a coin session is
    /// open the acceptor is disabled for the duration of the sort so coin
    /// pulses cannot interleave with the verdict.
    #[instrument(name = "link_sort", skip(self), fields(denom = denom.value()))]
    pub async fn send_sort_command(&self, denom: BillDenom) -> bool {
        let _gate = self.sort_gate.lock().await;

        let interlock = self.is_session_open();
        if interlock {
            if let Err(e) = self.command(HostCommand::DisableCoin).await {
                warn!(error = %e, "failed to pause coin acceptance for sort");
            }
        }

        let verdict = self.request_sort(denom.value()).await;

        if interlock && self.is_session_open() {
            if let Err(e) = self.command(HostCommand::EnableCoin).await {
                warn!(error = %e, "failed to resume coin acceptance after sort");
            }
        }

        verdict
    }

    async fn request_sort(&self, denom: u32) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .requests
            .send(LinkRequest::Sort {
                denom,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            error!(denom, "sort not sent, link closed");
            return false;
        }
        match timeout(self.sort_timeout, rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => {
                warn!(denom, "sort dropped, connection lost");
                false
            }
            Err(_) => {
                warn!(denom, "sort verdict timed out");
                false
            }
        }
    }

    async fn command(&self, command: HostCommand) -> LinkResult<()> {
        let (tx, rx) = oneshot::channel();
        debug!(%command, "submitting command");
        self.requests
            .send(LinkRequest::Command {
                command,
                respond_to: tx,
            })
            .await
            .map_err(|_| LinkError::Closed)?;
        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    /// Marks whether a coin session currently owns the acceptor. The link
    /// re-enables coin acceptance after reconnects and sorts only while a
    /// session is open.
    pub fn mark_session_open(&self, open: bool) {
        self.session_open.store(open, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_session_open(&self) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }

    /// Stops the link task. In-flight commands fail with
    /// [`LinkError::Disconnected`].
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a shutdown issued between two
        // select registrations is not lost.
        self.shutdown.notify_one();
    }
}

enum LoopExit {
    Shutdown,
    Reconnect,
}

/// Owns the serial stream and runs the reader loop.
pub struct SerialLinkTask {
    config: LinkConfig,
    requests: mpsc::Receiver<LinkRequest>,
    events: broadcast::Sender<LinkEvent>,
    coins: Inventory,
    session_open: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    pending_acks: Vec<(String, oneshot::Sender<LinkResult<()>>)>,
    pending_sort: Option<oneshot::Sender<bool>>,
}

impl SerialLinkTask {
    /// Runs until [`SerialLink::shutdown`] or until every handle is gone.
    /// Open failures and broken connections go through the reconnect
    /// backoff; a fresh connection re-enables coin acceptance when a
    /// session is open.
    pub async fn run(mut self) {
        let mut backoff = self.config.backoff.start();
        while self.running.load(Ordering::SeqCst) {
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => {
                    info!(path = %self.config.socket_path, "serial link connected");
                    backoff = self.config.backoff.start();
                    match self.serve_connection(stream).await {
                        LoopExit::Shutdown => break,
                        LoopExit::Reconnect => {
                            warn!("serial connection lost, reconnecting");
                            self.fail_pending();
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %self.config.socket_path, error = %e, "serial open failed");
                    self.reject_queued_requests();
                    tokio::select! {
                        () = backoff.wait() => {}
                        () = self.shutdown.notified() => break,
                    }
                }
            }
        }
        info!("serial link task stopped");
        self.fail_pending();
    }

    async fn serve_connection(&mut self, stream: UnixStream) -> LoopExit {
        let (read_half, mut write_half) = stream.into_split();

        if self.session_open.load(Ordering::SeqCst) {
            debug!("session open, re-enabling coin acceptance");
            let line = HostCommand::EnableCoin.encode();
            if write_line(&mut write_half, &line).await.is_err() {
                return LoopExit::Reconnect;
            }
        }

        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request, &mut write_half).await {
                            return LoopExit::Reconnect;
                        }
                    }
                    None => return LoopExit::Shutdown,
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => {
                        warn!("serial stream reached EOF");
                        return LoopExit::Reconnect;
                    }
                    Err(e) => {
                        warn!(error = %e, "serial read error");
                        return LoopExit::Reconnect;
                    }
                },
                () = self.shutdown.notified() => return LoopExit::Shutdown,
            }
        }
    }

    /// Returns `false` when the connection must be re-established.
    async fn handle_request(
        &mut self,
        request: LinkRequest,
        writer: &mut OwnedWriteHalf,
    ) -> bool {
        self.pending_acks.retain(|(_, tx)| !tx.is_closed());
        match request {
            LinkRequest::Command {
                command,
                respond_to,
            } => {
                let line = command.encode();
                trace!(%line, "writing command");
                if let Err(e) = write_line(writer, &line).await {
                    warn!(%line, error = %e, "serial write failed");
                    let _ = respond_to.send(Err(LinkError::Disconnected));
                    return false;
                }
                self.pending_acks.push((command.ack_echo(), respond_to));
            }
            LinkRequest::Sort { denom, respond_to } => {
                if let Some(pending) = &self.pending_sort {
                    if !pending.is_closed() {
                        warn!(denom, "sort refused, another sort is in flight");
                        let _ = respond_to.send(false);
                        return true;
                    }
                }
                let line = HostCommand::Sort { denom }.encode();
                trace!(%line, "writing sort");
                if let Err(e) = write_line(writer, &line).await {
                    warn!(%line, error = %e, "serial write failed");
                    let _ = respond_to.send(false);
                    return false;
                }
                self.pending_sort = Some(respond_to);
            }
        }
        true
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        trace!(%line, "serial line");

        let parsed = parse_line(line);

        if self.pending_sort.is_some() {
            let verdict = match &parsed {
                Ok(McuMessage::SortDone { .. }) => Some(true),
                _ => sort_verdict(line),
            };
            if let Some(verdict) = verdict {
                if let Some(respond_to) = self.pending_sort.take() {
                    debug!(verdict, "sort resolved");
                    let _ = respond_to.send(verdict);
                }
            }
        }

        match parsed {
            Ok(McuMessage::Coin { denom }) => self.on_coin(denom),
            Ok(McuMessage::Ack { echo }) => self.on_ack(&echo),
            Ok(McuMessage::DispenseDone { denom, qty }) => self.on_dispense_done(denom, qty),
            Ok(McuMessage::SortDone { denom }) => {
                let _ = self.events.send(LinkEvent::SortDone { denom });
            }
            Ok(McuMessage::Err { text }) => {
                warn!(%text, "firmware error");
                let _ = self.events.send(LinkEvent::Error(text));
            }
            Ok(McuMessage::Ready) => {
                info!("firmware ready");
                let _ = self.events.send(LinkEvent::Firmware(FirmwareStatus::Ready));
            }
            Ok(McuMessage::Homing) => {
                let _ = self.events.send(LinkEvent::Firmware(FirmwareStatus::Homing));
            }
            Ok(McuMessage::Ok) => {
                debug!("firmware ok");
            }
            Err(ParseError::MalformedField { line }) => {
                warn!(%line, "malformed serial line dropped");
            }
            Err(ParseError::UnknownLine { line }) => {
                debug!(%line, "unknown serial line ignored");
            }
        }
    }

    fn on_coin(&mut self, raw: u32) {
        let Ok(denom) = CoinDenom::try_from(raw) else {
            warn!(denom = raw, "unsupported coin denomination reported");
            return;
        };
        // Stock grows as the user feeds the machine; the credit must be
        // observable before any subscriber sees the event.
        match self.coins.add(denom.value(), 1) {
            Ok(count) => debug!(denom = denom.value(), count, "coin credited"),
            Err(e) => error!(denom = denom.value(), error = %e, "coin credit failed"),
        }
        let _ = self.events.send(LinkEvent::Coin { denom });
    }

    fn on_ack(&mut self, echo: &str) {
        if let Some(index) = self
            .pending_acks
            .iter()
            .position(|(expected, _)| expected == echo)
        {
            let (_, respond_to) = self.pending_acks.remove(index);
            let _ = respond_to.send(Ok(()));
        } else {
            warn!(%echo, "unexpected acknowledgement");
        }
        if echo.starts_with("DISPENSE:") {
            let _ = self.events.send(LinkEvent::DispenseAck {
                echo: echo.to_string(),
            });
        }
    }

    fn on_dispense_done(&mut self, denom: u32, qty: u32) {
        match self.coins.deduct(denom, qty) {
            Ok(true) => debug!(denom, qty, "coin payout debited"),
            Ok(false) => warn!(denom, qty, "payout exceeded recorded stock"),
            Err(e) => error!(denom, qty, error = %e, "coin payout debit failed"),
        }
        let _ = self.events.send(LinkEvent::DispenseDone { denom, qty });
    }

    fn reject_queued_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                LinkRequest::Command { respond_to, .. } => {
                    let _ = respond_to.send(Err(LinkError::NotConnected));
                }
                LinkRequest::Sort { respond_to, .. } => {
                    let _ = respond_to.send(false);
                }
            }
        }
    }

    fn fail_pending(&mut self) {
        for (_, respond_to) in self.pending_acks.drain(..) {
            let _ = respond_to.send(Err(LinkError::Disconnected));
        }
        if let Some(respond_to) = self.pending_sort.take() {
            let _ = respond_to.send(false);
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
