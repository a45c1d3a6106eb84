//! Bill acceptance pipeline: intake, UV authentication, denomination
//! classification, sorter dispatch and inventory commit, with reject
//! semantics on every failing stage.

use std::time::Duration;

use derive_builder::Builder;
use exchange_core::BillDenom;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::hardware::classifier::ClassifierPort;
use crate::hardware::gpio::{IrSensor, Led, Motor, MotorGuard};
use crate::inventory::{Inventory, InventoryError};
use crate::transport::serial_link::SerialLink;

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct AcceptorTiming {
    /// Forward run that pulls the bill under the camera.
    #[builder(default = "Duration::from_millis(400)")]
    pub feed: Duration,
    /// Reverse run that hands a rejected bill back.
    #[builder(default = "Duration::from_millis(1000)")]
    pub reverse: Duration,
    /// Forward run that pushes a sorted bill into its bin.
    #[builder(default = "Duration::from_millis(1500)")]
    pub push: Duration,
    /// How long to wait for a bill to break the entry beam.
    #[builder(default = "Duration::from_secs(60)")]
    pub ir_wait: Duration,
    #[builder(default = "Duration::from_millis(50)")]
    pub ir_poll: Duration,
    #[builder(default = "0.9")]
    pub motor_speed: f32,
}

impl Default for AcceptorTiming {
    fn default() -> Self {
        AcceptorTimingBuilder::default()
            .build()
            .expect("builder defaults are complete")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TimeoutNoBill,
    FakeBill,
    DenomUnknown,
    DenomNotRequired,
    SorterNoAck,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::TimeoutNoBill => "timeout_no_bill",
            RejectReason::FakeBill => "fake_bill",
            RejectReason::DenomUnknown => "denom_unknown",
            RejectReason::DenomNotRequired => "denom_not_required",
            RejectReason::SorterNoAck => "sorter_no_ack",
        }
    }
}

impl core::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one acceptance attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted {
        denom: BillDenom,
    },
    Rejected {
        /// What the classifier saw, when it saw anything usable.
        detected: Option<u32>,
        reason: RejectReason,
    },
}

impl AcceptOutcome {
    #[must_use]
    pub fn accepted(&self) -> bool {
        matches!(self, AcceptOutcome::Accepted { .. })
    }

    #[must_use]
    pub fn detected(&self) -> Option<u32> {
        match self {
            AcceptOutcome::Accepted { denom } => Some(denom.value()),
            AcceptOutcome::Rejected { detected, .. } => *detected,
        }
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AcceptOutcome::Accepted { .. } => "accepted",
            AcceptOutcome::Rejected { reason, .. } => reason.as_str(),
        }
    }
}

/// Progress of the pipeline, streamed to an optional observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Inserted,
    Authenticated { ok: bool },
    Classified { denom: Option<u32> },
    SortAcked { ok: bool },
    Committed { denom: u32 },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// The bill acceptance state machine.
///
/// Callers block on [`BillAcceptor::accept_bill`] until the attempt
/// resolves; the `&mut self` receiver makes concurrent attempts
/// impossible.
pub struct BillAcceptor<C> {
    intake: Box<dyn Motor>,
    white_led: Box<dyn Led>,
    entry_ir: Box<dyn IrSensor>,
    classifier: C,
    link: SerialLink,
    bills: Inventory,
    timing: AcceptorTiming,
}

impl<C: ClassifierPort> BillAcceptor<C> {
    pub fn new(
        intake: Box<dyn Motor>,
        white_led: Box<dyn Led>,
        entry_ir: Box<dyn IrSensor>,
        classifier: C,
        link: SerialLink,
        bills: Inventory,
        timing: AcceptorTiming,
    ) -> Self {
        BillAcceptor {
            intake,
            white_led,
            entry_ir,
            classifier,
            link,
            bills,
            timing,
        }
    }

    /// Runs one acceptance attempt for the required denomination.
    pub async fn accept_bill(
        &mut self,
        required: BillDenom,
    ) -> Result<AcceptOutcome, AcceptorError> {
        self.accept_bill_with_events(required, None).await
    }

    /// Like [`BillAcceptor::accept_bill`] but streams [`PipelineEvent`]s
    /// to `events` as the bill moves through the stages.
    #[instrument(name = "accept_bill", skip(self, events), fields(required = required.value()))]
    pub async fn accept_bill_with_events(
        &mut self,
        required: BillDenom,
        events: Option<&mpsc::Sender<PipelineEvent>>,
    ) -> Result<AcceptOutcome, AcceptorError> {
        if !self.wait_for_bill().await {
            info!("no bill inserted before timeout");
            return Ok(self.reject_without_reverse(RejectReason::TimeoutNoBill, events));
        }
        emit(events, PipelineEvent::Inserted);

        debug!("bill detected, feeding");
        self.run_intake_forward(self.timing.feed).await;

        let genuine = match self.classifier.authenticate().await {
            Ok(result) => result.is_genuine(),
            Err(e) => {
                warn!(error = %e, "authentication capture failed");
                false
            }
        };
        emit(events, PipelineEvent::Authenticated { ok: genuine });
        if !genuine {
            info!("authentication failed, reversing bill");
            return Ok(self.reject(None, RejectReason::FakeBill, events).await);
        }

        let detected = self.classify().await;
        emit(events, PipelineEvent::Classified { denom: detected });
        let Some(detected) = detected else {
            info!("denomination unknown, reversing bill");
            return Ok(self.reject(None, RejectReason::DenomUnknown, events).await);
        };
        if detected != required.value() {
            info!(detected, "wrong denomination, reversing bill");
            return Ok(self
                .reject(Some(detected), RejectReason::DenomNotRequired, events)
                .await);
        }

        let sorted = self.link.send_sort_command(required).await;
        emit(events, PipelineEvent::SortAcked { ok: sorted });
        if !sorted {
            warn!("sorter did not acknowledge, reversing bill");
            return Ok(self
                .reject(Some(detected), RejectReason::SorterNoAck, events)
                .await);
        }

        // Credit before the final push: a crash mid-push can at worst
        // over-count a bill that is physically inside the machine, never
        // credit the user twice.
        self.bills.add(required.value(), 1)?;
        emit(
            events,
            PipelineEvent::Committed {
                denom: required.value(),
            },
        );

        self.run_intake_forward(self.timing.push).await;
        info!(denom = required.value(), "bill accepted");
        Ok(AcceptOutcome::Accepted { denom: required })
    }

    async fn wait_for_bill(&self) -> bool {
        let deadline = Instant::now() + self.timing.ir_wait;
        while !self.entry_ir.detecting() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timing.ir_poll).await;
        }
        true
    }

    async fn run_intake_forward(&mut self, duration: Duration) {
        let _guard = MotorGuard::forward(self.intake.as_mut(), self.timing.motor_speed);
        tokio::time::sleep(duration).await;
    }

    async fn run_intake_reverse(&mut self, duration: Duration) {
        let _guard = MotorGuard::backward(self.intake.as_mut(), self.timing.motor_speed);
        tokio::time::sleep(duration).await;
    }

    async fn classify(&mut self) -> Option<u32> {
        self.white_led.on();
        let result = self.classifier.classify_denomination().await;
        self.white_led.off();
        match result {
            Ok(classification) => classification.denomination(),
            Err(e) => {
                warn!(error = %e, "classification capture failed");
                None
            }
        }
    }

    async fn reject(
        &mut self,
        detected: Option<u32>,
        reason: RejectReason,
        events: Option<&mpsc::Sender<PipelineEvent>>,
    ) -> AcceptOutcome {
        self.run_intake_reverse(self.timing.reverse).await;
        emit(events, PipelineEvent::Rejected { reason });
        AcceptOutcome::Rejected { detected, reason }
    }

    fn reject_without_reverse(
        &self,
        reason: RejectReason,
        events: Option<&mpsc::Sender<PipelineEvent>>,
    ) -> AcceptOutcome {
        emit(events, PipelineEvent::Rejected { reason });
        AcceptOutcome::Rejected {
            detected: None,
            reason,
        }
    }
}

fn emit(events: Option<&mpsc::Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(events) = events {
        // Observers must never stall the pipeline.
        let _ = events.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::classifier::{Classification, ScriptedClassifier};
    use crate::hardware::gpio::{MockLed, MockMotor, ScriptedIr};
    use crate::inventory::InventoryKind;
    use crate::test_rig::{McuBehavior, McuSim, temp_socket};
    use crate::transport::serial_link::{LinkConfigBuilder, SerialLink};
    use std::sync::{Arc, Mutex};
    use crate::hardware::gpio::MotorLog;
    use tempfile::TempDir;

    struct Rig {
        acceptor: BillAcceptor<ScriptedClassifier>,
        motor_log: Arc<Mutex<MotorLog>>,
        bills: Inventory,
        _mcu: McuSim,
        _dirs: (TempDir, TempDir),
        link: SerialLink,
    }

    fn fast_timing() -> AcceptorTiming {
        AcceptorTimingBuilder::default()
            .feed(Duration::from_millis(5))
            .reverse(Duration::from_millis(5))
            .push(Duration::from_millis(5))
            .ir_wait(Duration::from_millis(100))
            .ir_poll(Duration::from_millis(5))
            .build()
            .expect("timing")
    }

    async fn rig(classifier: ScriptedClassifier, bill_present: bool, sort_ok: bool) -> Rig {
        let (socket_dir, path) = temp_socket();
        let behavior = McuBehavior {
            sort_reply: Some(if sort_ok { "OK" } else { "ERR:no ack" }.to_string()),
            ..McuBehavior::default()
        };
        let mcu = McuSim::spawn(&path, behavior);

        let inv_dir = TempDir::new().expect("tempdir");
        let coins =
            Inventory::open(inv_dir.path().join("coins.json"), InventoryKind::Coins)
                .expect("coins");
        let bills =
            Inventory::open(inv_dir.path().join("bills.json"), InventoryKind::Bills)
                .expect("bills");

        let config = LinkConfigBuilder::default()
            .socket_path(path)
            .ack_timeout(Duration::from_millis(300))
            .sort_timeout(Duration::from_millis(500))
            .build()
            .expect("config");
        let (link, task) = SerialLink::channel(config, coins);
        tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let motor = MockMotor::new();
        let motor_log = motor.log_handle();
        let acceptor = BillAcceptor::new(
            Box::new(motor),
            Box::new(MockLed::new()),
            Box::new(ScriptedIr::always(bill_present)),
            classifier,
            link.clone(),
            bills.clone(),
            fast_timing(),
        );

        Rig {
            acceptor,
            motor_log,
            bills,
            _mcu: mcu,
            _dirs: (socket_dir, inv_dir),
            link,
        }
    }

    fn denom(value: u32) -> BillDenom {
        BillDenom::try_from(value).expect("denom")
    }

    #[tokio::test]
    async fn happy_path_commits_exactly_one_bill() {
        let mut rig = rig(ScriptedClassifier::passing(100), true, true).await;
        let before = rig.bills.count(100);

        let outcome = rig.acceptor.accept_bill(denom(100)).await.expect("accept");
        assert_eq!(
            outcome,
            AcceptOutcome::Accepted {
                denom: denom(100)
            }
        );
        assert_eq!(outcome.reason(), "accepted");
        assert_eq!(rig.bills.count(100), before + 1);

        // Feed forward + push forward, no reverse, everything stopped.
        let log = rig.motor_log.lock().expect("lock");
        assert_eq!(log.forward, 2);
        assert_eq!(log.backward, 0);
        assert_eq!(log.stop, 2);
        rig.link.shutdown();
    }

    #[tokio::test]
    async fn fake_bill_is_reversed() {
        let classifier = ScriptedClassifier::passing(100)
            .with_auth(Classification::new("fake", 0.97));
        let mut rig = rig(classifier, true, true).await;
        let before = rig.bills.snapshot();

        let outcome = rig.acceptor.accept_bill(denom(100)).await.expect("accept");
        assert_eq!(
            outcome,
            AcceptOutcome::Rejected {
                detected: None,
                reason: RejectReason::FakeBill
            }
        );
        assert_eq!(rig.bills.snapshot(), before);

        let log = rig.motor_log.lock().expect("lock");
        assert_eq!(log.forward, 1);
        assert_eq!(log.backward, 1);
        assert_eq!(log.stop, 2);
        rig.link.shutdown();
    }

    #[tokio::test]
    async fn low_confidence_authentication_rejects() {
        let classifier = ScriptedClassifier::passing(100)
            .with_auth(Classification::new("genuine", 0.6));
        let mut rig = rig(classifier, true, true).await;
        let outcome = rig.acceptor.accept_bill(denom(100)).await.expect("accept");
        assert_eq!(outcome.reason(), "fake_bill");
        rig.link.shutdown();
    }

    #[tokio::test]
    async fn wrong_denomination_is_reported_and_reversed() {
        let classifier = ScriptedClassifier::passing(100)
            .with_denom(Classification::new("50", 0.95));
        let mut rig = rig(classifier, true, true).await;
        let before = rig.bills.snapshot();

        let outcome = rig.acceptor.accept_bill(denom(100)).await.expect("accept");
        assert_eq!(
            outcome,
            AcceptOutcome::Rejected {
                detected: Some(50),
                reason: RejectReason::DenomNotRequired
            }
        );
        assert_eq!(outcome.reason(), "denom_not_required");
        assert_eq!(rig.bills.snapshot(), before);

        let log = rig.motor_log.lock().expect("lock");
        assert_eq!(log.backward, 1);
        assert_eq!(log.stop, 2);
        rig.link.shutdown();
    }

    #[tokio::test]
    async fn unreadable_denomination_rejects_unknown() {
        let classifier = ScriptedClassifier::passing(100)
            .with_denom(Classification::new("100", 0.4));
        let mut rig = rig(classifier, true, true).await;
        let outcome = rig.acceptor.accept_bill(denom(100)).await.expect("accept");
        assert_eq!(outcome.reason(), "denom_unknown");
        assert_eq!(outcome.detected(), None);
        rig.link.shutdown();
    }

    #[tokio::test]
    async fn sorter_failure_rejects_after_classification() {
        let mut rig = rig(ScriptedClassifier::passing(100), true, false).await;
        let before = rig.bills.snapshot();

        let outcome = rig.acceptor.accept_bill(denom(100)).await.expect("accept");
        assert_eq!(outcome.reason(), "sorter_no_ack");
        assert_eq!(outcome.detected(), Some(100));
        assert_eq!(rig.bills.snapshot(), before);
        rig.link.shutdown();
    }

    #[tokio::test]
    async fn no_bill_times_out_without_motion() {
        let mut rig = rig(ScriptedClassifier::passing(100), false, true).await;
        let outcome = rig.acceptor.accept_bill(denom(100)).await.expect("accept");
        assert_eq!(outcome.reason(), "timeout_no_bill");

        let log = rig.motor_log.lock().expect("lock");
        assert_eq!(log.forward, 0);
        assert_eq!(log.backward, 0);
        rig.link.shutdown();
    }

    #[tokio::test]
    async fn pipeline_events_follow_the_stages() {
        let mut rig = rig(ScriptedClassifier::passing(100), true, true).await;
        let (tx, mut rx) = mpsc::channel(16);

        rig.acceptor
            .accept_bill_with_events(denom(100), Some(&tx))
            .await
            .expect("accept");

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                PipelineEvent::Inserted,
                PipelineEvent::Authenticated { ok: true },
                PipelineEvent::Classified { denom: Some(100) },
                PipelineEvent::SortAcked { ok: true },
                PipelineEvent::Committed { denom: 100 },
            ]
        );
        rig.link.shutdown();
    }
}
