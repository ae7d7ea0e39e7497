//! Several orchestrators over one ledger: cached sessions must follow
//! writes made elsewhere, and a writer holding stale state must not append.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deliberation::state::{LedgerRecord, LedgerResult, RecordFilter, RecordKind};
use deliberation::{
    Collaborators, DeliberationConfig, DispositionBus, InMemoryLedger, InMemoryTranscriptStore,
    JurorPool, Ledger, ManualClock, ManualScheduler, Outcome, Phase, SessionOrchestrator,
    SessionPhase, StaticPoolProvider, TerminationReason, TranscriptEntry,
};
use tokio::sync::Notify;

/// Backends one deployment's orchestrators share
struct Shared {
    ledger: Arc<dyn Ledger>,
    transcripts: Arc<InMemoryTranscriptStore>,
    clock: Arc<ManualClock>,
}

impl Shared {
    fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            transcripts: Arc::new(InMemoryTranscriptStore::new()),
            clock: Arc::new(ManualClock::default()),
        }
    }

    fn instance(&self, config: DeliberationConfig) -> Arc<SessionOrchestrator> {
        self.instance_on(self.ledger.clone(), config)
    }

    fn instance_on(
        &self,
        ledger: Arc<dyn Ledger>,
        config: DeliberationConfig,
    ) -> Arc<SessionOrchestrator> {
        SessionOrchestrator::new(
            config,
            Collaborators {
                ledger,
                transcripts: self.transcripts.clone(),
                pool: Arc::new(StaticPoolProvider::new(JurorPool::from_ids(
                    ["J1", "J2", "J3", "J4", "J5"],
                    1,
                ))),
                scheduler: Arc::new(ManualScheduler::new()),
                sink: Arc::new(DispositionBus::new()),
                clock: self.clock.clone(),
            },
        )
        .unwrap()
    }
}

fn entries(phase: Phase) -> Vec<TranscriptEntry> {
    vec![TranscriptEntry::new("J1", format!("{} notes", phase))]
}

async fn split_round(orchestrator: &SessionOrchestrator, session_id: &str) {
    let mut state = orchestrator.get_session_state(session_id).await.unwrap();
    while let Some(phase) = state.phase.active().filter(|p| *p != Phase::Vote) {
        state = orchestrator
            .complete_phase(session_id, phase, entries(phase))
            .await
            .unwrap();
    }
    let split = [Outcome::Acknowledge, Outcome::Refer, Outcome::Escalate];
    for (juror, outcome) in state.panel.iter().zip(split) {
        orchestrator
            .submit_vote(session_id, juror, outcome, "split")
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_cached_session_follows_other_writers() {
    let shared = Shared::new(Arc::new(InMemoryLedger::new()));
    let a = shared.instance(DeliberationConfig::default());
    let b = shared.instance(DeliberationConfig::default());

    let summary = a.assign_panel("P1").await.unwrap();
    let sid = summary.session_id.clone();
    assert_eq!(a.get_session_state(&sid).await.unwrap().phase, SessionPhase::Assess);

    // B completes ASSESS while A holds ASSESS in its cache
    b.complete_phase(&sid, Phase::Assess, entries(Phase::Assess))
        .await
        .unwrap();

    let err = a
        .complete_phase(&sid, Phase::Assess, entries(Phase::Assess))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    assert_eq!(a.get_session_state(&sid).await.unwrap().phase, SessionPhase::Position);

    let state = a
        .complete_phase(&sid, Phase::Position, entries(Phase::Position))
        .await
        .unwrap();
    assert_eq!(state.phase, SessionPhase::CrossExamine);

    // A fresh instance replays the same history, and it verifies
    let c = shared.instance(DeliberationConfig::default());
    assert_eq!(c.get_session_state(&sid).await.unwrap(), state);
    let timeline = c.reconstruct_audit(&sid).await.unwrap();
    assert_eq!(timeline.witness_count(), 2);
    assert!(timeline.verification.is_valid);
}

/// Holds the first conditional append until released, so another writer can
/// slip in between a caller's read and its write.
struct GatedLedger {
    inner: Arc<InMemoryLedger>,
    armed: AtomicBool,
    arrived: Notify,
    release: Notify,
}

#[async_trait]
impl Ledger for GatedLedger {
    async fn append(&self, record: LedgerRecord) -> LedgerResult<u64> {
        self.inner.append(record).await
    }

    async fn append_after(&self, record: LedgerRecord, expected_last: u64) -> LedgerResult<u64> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.arrived.notify_one();
            self.release.notified().await;
        }
        self.inner.append_after(record, expected_last).await
    }

    async fn read(&self, filter: &RecordFilter) -> LedgerResult<Vec<LedgerRecord>> {
        self.inner.read(filter).await
    }
}

#[tokio::test]
async fn test_interleaved_writer_loses_and_history_stays_linear() {
    let inner = Arc::new(InMemoryLedger::new());
    let gated = Arc::new(GatedLedger {
        inner: inner.clone(),
        armed: AtomicBool::new(true),
        arrived: Notify::new(),
        release: Notify::new(),
    });
    let shared = Shared::new(inner.clone());
    let a = shared.instance_on(gated.clone(), DeliberationConfig::default());
    let b = shared.instance(DeliberationConfig::default());

    let summary = a.assign_panel("P1").await.unwrap();
    let sid = summary.session_id.clone();

    // A validates ASSESS and stalls at the append
    let pending = {
        let a = a.clone();
        let sid = sid.clone();
        tokio::spawn(async move {
            a.complete_phase(&sid, Phase::Assess, entries(Phase::Assess))
                .await
        })
    };
    gated.arrived.notified().await;

    b.complete_phase(&sid, Phase::Assess, entries(Phase::Assess))
        .await
        .unwrap();
    gated.release.notify_one();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");

    // A caught up instead of keeping its rejected view
    assert_eq!(a.get_session_state(&sid).await.unwrap().phase, SessionPhase::Position);

    let witnessed = inner
        .read(&RecordFilter::session(&sid).with_kind(RecordKind::PhaseWitnessed))
        .await
        .unwrap();
    assert_eq!(witnessed.len(), 1);
    let timeline = b.reconstruct_audit(&sid).await.unwrap();
    assert!(timeline.verification.is_valid);
}

#[tokio::test]
async fn test_round_limit_is_the_one_recorded_at_assignment() {
    let shared = Shared::new(Arc::new(InMemoryLedger::new()));
    let assigner = shared.instance(DeliberationConfig {
        max_rounds: 2,
        ..DeliberationConfig::default()
    });
    let other = shared.instance(DeliberationConfig::default());
    assert_eq!(other.config().max_rounds, 3);

    let summary = assigner.assign_panel("P1").await.unwrap();
    let sid = summary.session_id.clone();

    split_round(&other, &sid).await;
    let state = other.get_session_state(&sid).await.unwrap();
    assert_eq!(state.round, 2);
    assert_eq!(state.max_rounds, 2);
    assert_eq!(state.phase, SessionPhase::CrossExamine);

    split_round(&other, &sid).await;
    let state = other.get_session_state(&sid).await.unwrap();
    assert_eq!(
        state.phase,
        SessionPhase::Complete {
            outcome: Outcome::Escalate
        }
    );
    assert_eq!(state.termination_reason, Some(TerminationReason::Deadlock));
    assert_eq!(state.round, 2);
}

#[tokio::test]
async fn test_shorter_config_does_not_cut_a_recorded_limit() {
    let shared = Shared::new(Arc::new(InMemoryLedger::new()));
    let assigner = shared.instance(DeliberationConfig::default());
    let other = shared.instance(DeliberationConfig {
        max_rounds: 1,
        ..DeliberationConfig::default()
    });

    let summary = assigner.assign_panel("P1").await.unwrap();
    let sid = summary.session_id.clone();

    for _ in 0..2 {
        split_round(&other, &sid).await;
    }
    let state = other.get_session_state(&sid).await.unwrap();
    assert!(!state.is_terminal());
    assert_eq!(state.round, 3);
    assert_eq!(state.max_rounds, 3);
    assert_eq!(state.phase, SessionPhase::CrossExamine);
}
