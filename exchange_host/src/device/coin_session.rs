//! A bounded interval of coin acceptance toward a target amount.
//!
//! The session enables the coin acceptor, counts validated coins from the
//! link's event stream, fires a one-shot "reached" signal at the target
//! and disables the acceptor. Coins that land between the target and the
//! firmware honoring the disable are still counted; overshoot is
//! tolerated and paid out as excess by the orchestrator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use exchange_core::{Breakdown, CoinDenom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::serial_link::{LinkEvent, LinkResult, SerialLink};

/// Authoritative per-session totals. Monotonically increasing until the
/// session is stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCounters {
    counts: BTreeMap<u32, u32>,
    total: u32,
}

impl SessionCounters {
    #[must_use]
    pub fn count(&self, denom: u32) -> u32 {
        self.counts.get(&denom).copied().unwrap_or(0)
    }

    /// Running total in minor currency units.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// The inserted coins as a dispensable breakdown (used for refunds).
    #[must_use]
    pub fn breakdown(&self) -> Breakdown {
        self.counts
            .iter()
            .map(|(&denom, &count)| (denom, count))
            .collect()
    }

    fn record(&mut self, denom: CoinDenom) -> u32 {
        let entry = self.counts.entry(denom.value()).or_insert(0);
        *entry += 1;
        self.total += denom.value();
        *entry
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A coin was counted. Carries the per-denomination count and the new
    /// session total.
    Coin {
        denom: CoinDenom,
        denom_count: u32,
        total: u32,
    },
    /// The required amount has been reached for the first time.
    Reached { total: u32 },
}

/// One active coin acceptance session.
pub struct CoinSession {
    link: SerialLink,
    counters: Arc<Mutex<SessionCounters>>,
    reached: Arc<AtomicBool>,
    consumer: JoinHandle<()>,
}

impl CoinSession {
    /// Enables coin acceptance and starts counting toward `required`
    /// (0 = unbounded). Session events go to `events`.
    pub async fn start(
        link: SerialLink,
        required: u32,
        events: mpsc::Sender<SessionEvent>,
    ) -> LinkResult<CoinSession> {
        // Subscribe before enabling so the first coin cannot be missed.
        let stream = link.subscribe();
        link.mark_session_open(true);
        if let Err(e) = link.enable_coin().await {
            link.mark_session_open(false);
            return Err(e);
        }
        info!(required, "coin session started");

        let counters = Arc::new(Mutex::new(SessionCounters::default()));
        let reached = Arc::new(AtomicBool::new(false));
        let consumer = tokio::spawn(consume(
            link.clone(),
            stream,
            required,
            Arc::clone(&counters),
            Arc::clone(&reached),
            events,
        ));

        Ok(CoinSession {
            link,
            counters,
            reached,
            consumer,
        })
    }

    /// Consistent snapshot of the session totals.
    #[must_use]
    pub fn counters(&self) -> SessionCounters {
        self.counters.lock().expect("should not be poisoned").clone()
    }

    #[must_use]
    pub fn reached(&self) -> bool {
        self.reached.load(Ordering::SeqCst)
    }

    /// Disables coin acceptance and returns the final totals. The link's
    /// reader stays up for subsequent sort and dispense traffic.
    pub async fn stop(self) -> SessionCounters {
        if self.link.is_session_open() {
            self.link.mark_session_open(false);
            if let Err(e) = self.link.disable_coin().await {
                warn!(error = %e, "failed to disable coin acceptance");
            }
        }
        self.consumer.abort();
        let counters = self.counters.lock().expect("should not be poisoned").clone();
        info!(total = counters.total(), "coin session stopped");
        counters
    }
}

async fn consume(
    link: SerialLink,
    mut stream: tokio::sync::broadcast::Receiver<LinkEvent>,
    required: u32,
    counters: Arc<Mutex<SessionCounters>>,
    reached: Arc<AtomicBool>,
    events: mpsc::Sender<SessionEvent>,
) {
    loop {
        match stream.recv().await {
            Ok(LinkEvent::Coin { denom }) => {
                let (denom_count, total) = {
                    let mut counters = counters.lock().expect("should not be poisoned");
                    let denom_count = counters.record(denom);
                    (denom_count, counters.total())
                };
                debug!(denom = denom.value(), denom_count, total, "coin counted");
                let _ = events
                    .send(SessionEvent::Coin {
                        denom,
                        denom_count,
                        total,
                    })
                    .await;

                if required > 0 && total >= required && !reached.swap(true, Ordering::SeqCst) {
                    info!(total, required, "required amount reached");
                    let _ = events.send(SessionEvent::Reached { total }).await;
                    // One-shot: close the session so reconnects stop
                    // re-enabling the acceptor, then tell the firmware.
                    link.mark_session_open(false);
                    if let Err(e) = link.disable_coin().await {
                        warn!(error = %e, "failed to disable coin acceptance");
                    }
                }
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "coin session lagged behind link events");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
