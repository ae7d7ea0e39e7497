//! Session lifecycle integration tests: the orchestrator driven end to end
//! against in-memory backends, a manual clock and a manual scheduler.
//!
//! Covers: selection determinism, concurrent assignment, supermajority with
//! dissent, deadlock escalation, timeout precedence, substitution bounds.

use std::sync::Arc;

use chrono::Duration;
use deliberation::panel::PanelSelector;
use deliberation::{
    Clock, Collaborators, DeliberationConfig, DeliberationError, DispositionBus, InMemoryLedger,
    InMemoryTranscriptStore, JurorPool, ManualClock, ManualScheduler, Outcome, Phase,
    SessionOrchestrator, SessionPhase, SessionState, StaticPoolProvider, TerminationReason,
    TranscriptEntry,
};

struct Harness {
    orchestrator: Arc<SessionOrchestrator>,
    clock: Arc<ManualClock>,
    scheduler: Arc<ManualScheduler>,
    bus: Arc<DispositionBus>,
    pool: Arc<StaticPoolProvider>,
}

fn pool_of(n: usize) -> JurorPool {
    JurorPool::from_ids((1..=n).map(|i| format!("J{}", i)), 1)
}

fn harness_with(config: DeliberationConfig, pool_size: usize) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let scheduler = Arc::new(ManualScheduler::new());
    let bus = Arc::new(DispositionBus::new());
    let pool = Arc::new(StaticPoolProvider::new(pool_of(pool_size)));
    let orchestrator = SessionOrchestrator::new(
        config,
        Collaborators {
            ledger: Arc::new(InMemoryLedger::new()),
            transcripts: Arc::new(InMemoryTranscriptStore::new()),
            pool: pool.clone(),
            scheduler: scheduler.clone(),
            sink: bus.clone(),
            clock: clock.clone(),
        },
    )
    .unwrap();
    Harness {
        orchestrator,
        clock,
        scheduler,
        bus,
        pool,
    }
}

fn harness(pool_size: usize) -> Harness {
    harness_with(DeliberationConfig::default(), pool_size)
}

/// Complete every non-VOTE phase the session is currently in.
async fn advance_to_vote(h: &Harness, session_id: &str) -> SessionState {
    let mut state = h.orchestrator.get_session_state(session_id).await.unwrap();
    while let Some(phase) = state.phase.active() {
        if phase == Phase::Vote {
            break;
        }
        let entries = state
            .panel
            .iter()
            .map(|j| TranscriptEntry::new(j.clone(), format!("{} notes from {}", phase, j)))
            .collect();
        state = h
            .orchestrator
            .complete_phase(session_id, phase, entries)
            .await
            .unwrap();
    }
    state
}

/// Cast one ballot per seat, in seat order.
async fn vote_round(h: &Harness, session_id: &str, outcomes: [Outcome; 3]) -> SessionState {
    let state = advance_to_vote(h, session_id).await;
    assert_eq!(state.phase, SessionPhase::Vote);
    let mut last = state.clone();
    for (juror, outcome) in state.panel.iter().zip(outcomes) {
        last = h
            .orchestrator
            .submit_vote(session_id, juror, outcome, format!("{} says {}", juror, outcome))
            .await
            .unwrap();
    }
    last
}

const SPLIT: [Outcome; 3] = [Outcome::Acknowledge, Outcome::Refer, Outcome::Escalate];

// ── Panel selection ────────────────────────────────────────────────

#[tokio::test]
async fn test_same_inputs_same_panel_across_instances() {
    let first = harness(7);
    let second = harness(7);

    let a = first.orchestrator.assign_panel("P42").await.unwrap();
    let b = second.orchestrator.assign_panel("P42").await.unwrap();

    assert_eq!(a.panel, b.panel);
    assert_ne!(a.session_id, b.session_id);

    let expected = PanelSelector::default()
        .select("P42", None, &pool_of(7))
        .unwrap();
    assert_eq!(a.panel, expected.to_vec());
}

#[tokio::test]
async fn test_configured_seed_feeds_selection() {
    let unseeded = harness(20);
    let seeded = harness_with(
        DeliberationConfig {
            selection_seed: Some("term-2026".into()),
            ..Default::default()
        },
        20,
    );

    let expected_unseeded = PanelSelector::default()
        .select("P1", None, &pool_of(20))
        .unwrap();
    let expected_seeded = PanelSelector::default()
        .select("P1", Some("term-2026"), &pool_of(20))
        .unwrap();

    let a = unseeded.orchestrator.assign_panel("P1").await.unwrap();
    let b = seeded.orchestrator.assign_panel("P1").await.unwrap();
    assert_eq!(a.panel, expected_unseeded.to_vec());
    assert_eq!(b.panel, expected_seeded.to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assignment_yields_one_session() {
    let h = harness(9);

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.assign_panel("P-concurrent").await })
        })
        .collect();

    let summaries: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let first = &summaries[0];
    assert!(summaries.iter().all(|s| s == first));
    assert_eq!(h.scheduler.scheduled().len(), 1);

    let timeline = h
        .orchestrator
        .reconstruct_audit(&first.session_id)
        .await
        .unwrap();
    assert_eq!(timeline.records.len(), 1);
}

#[tokio::test]
async fn test_pool_exhaustion_reported() {
    let h = harness(2);
    let err = h.orchestrator.assign_panel("P1").await.unwrap_err();
    assert_eq!(err.code(), "POOL_EXHAUSTED");
}

// ── Phase ordering ─────────────────────────────────────────────────

#[tokio::test]
async fn test_out_of_order_phase_rejected() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();

    let err = h
        .orchestrator
        .complete_phase(&summary.session_id, Phase::CrossExamine, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, DeliberationError::InvalidTransition { .. }));

    let state = h
        .orchestrator
        .get_session_state(&summary.session_id)
        .await
        .unwrap();
    assert_eq!(state.phase, SessionPhase::Assess);
}

#[tokio::test]
async fn test_ballots_rejected_outside_vote_and_from_strangers() {
    let h = harness(6);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    // Still in ASSESS
    assert!(h
        .orchestrator
        .submit_vote(sid, &summary.panel[0], Outcome::Refer, "early")
        .await
        .is_err());

    advance_to_vote(&h, sid).await;

    let outsider = (1..=6)
        .map(|i| format!("J{}", i))
        .find(|j| !summary.panel.contains(j))
        .unwrap();
    let err = h
        .orchestrator
        .submit_vote(sid, &outsider, Outcome::Refer, "not seated")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "JUROR_NOT_ON_PANEL");

    h.orchestrator
        .submit_vote(sid, &summary.panel[0], Outcome::Refer, "first")
        .await
        .unwrap();
    let err = h
        .orchestrator
        .submit_vote(sid, &summary.panel[0], Outcome::Acknowledge, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, DeliberationError::DuplicateVote { round: 1, .. }));

    let state = h.orchestrator.get_session_state(sid).await.unwrap();
    assert_eq!(state.ballots_in_round, 1);
}

// ── Consensus ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_of_three_resolves_with_dissent() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    let state = vote_round(
        &h,
        sid,
        [Outcome::Escalate, Outcome::Acknowledge, Outcome::Escalate],
    )
    .await;

    assert_eq!(
        state.phase,
        SessionPhase::Complete {
            outcome: Outcome::Escalate
        }
    );
    assert_eq!(state.termination_reason, Some(TerminationReason::Supermajority));
    let dissent = state.dissent.unwrap();
    assert_eq!(dissent.juror_id, summary.panel[1]);
    assert_eq!(dissent.outcome, Outcome::Acknowledge);
    assert_eq!(dissent.majority_outcome, Outcome::Escalate);

    let dispositions = h.bus.for_session(sid);
    assert_eq!(dispositions.len(), 1);
    assert_eq!(dispositions[0].status(), "COMPLETE(ESCALATE)");
}

#[tokio::test]
async fn test_unanimous_resolution_has_no_dissent() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();

    let state = vote_round(&h, &summary.session_id, [Outcome::Refer; 3]).await;
    assert_eq!(state.outcome, Some(Outcome::Refer));
    assert!(state.dissent.is_none());
}

#[tokio::test]
async fn test_split_returns_to_cross_examine() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();

    let state = vote_round(&h, &summary.session_id, SPLIT).await;
    assert_eq!(state.phase, SessionPhase::CrossExamine);
    assert_eq!(state.round, 2);
    assert_eq!(state.ballots_in_round, 0);
    assert!(h.bus.for_session(&summary.session_id).is_empty());
}

#[tokio::test]
async fn test_three_split_rounds_deadlock_to_escalate() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    vote_round(&h, sid, SPLIT).await;
    vote_round(&h, sid, SPLIT).await;
    let state = vote_round(&h, sid, SPLIT).await;

    assert_eq!(
        state.phase,
        SessionPhase::Complete {
            outcome: Outcome::Escalate
        }
    );
    assert_eq!(state.termination_reason, Some(TerminationReason::Deadlock));
    assert_eq!(state.round, 3);

    let timeline = h.orchestrator.reconstruct_audit(sid).await.unwrap();
    let tallies = timeline.round_tallies();
    assert_eq!(tallies.len(), 3);
    for (i, (round, tally)) in tallies.iter().enumerate() {
        assert_eq!(*round, i as u32 + 1);
        assert_eq!(tally.total(), 3);
        assert_eq!(tally.count(Outcome::Refer), 1);
    }
    // Round 1: three phases + VOTE; rounds 2 and 3: CROSS_EXAMINE + VOTE
    assert_eq!(timeline.witness_count(), 8);
    assert!(timeline.verification.is_valid);
}

#[tokio::test]
async fn test_late_round_agreement_resolves() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    vote_round(&h, sid, SPLIT).await;
    let state = vote_round(
        &h,
        sid,
        [Outcome::Acknowledge, Outcome::Acknowledge, Outcome::Refer],
    )
    .await;

    assert_eq!(state.outcome, Some(Outcome::Acknowledge));
    assert_eq!(state.round, 2);
}

// ── Timeout ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_timeout_wins_over_final_ballot() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    vote_round(&h, sid, SPLIT).await;
    vote_round(&h, sid, SPLIT).await;

    let state = advance_to_vote(&h, sid).await;
    assert_eq!(state.round, 3);
    h.orchestrator
        .submit_vote(sid, &state.panel[0], Outcome::Refer, "r")
        .await
        .unwrap();
    h.orchestrator
        .submit_vote(sid, &state.panel[1], Outcome::Refer, "r")
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(3601));
    let state = h
        .orchestrator
        .submit_vote(sid, &state.panel[2], Outcome::Refer, "too late")
        .await
        .unwrap();

    assert_eq!(state.termination_reason, Some(TerminationReason::Timeout));
    assert_eq!(state.outcome, Some(Outcome::Escalate));

    let timeline = h.orchestrator.reconstruct_audit(sid).await.unwrap();
    let terminal = timeline.terminal().unwrap();
    assert_eq!(terminal.reason, TerminationReason::Timeout);
    // Partial tally holds only the two ballots cast in time
    assert_eq!(terminal.final_tally.as_ref().unwrap().total(), 2);
    assert!(timeline.is_partial());
}

#[tokio::test]
async fn test_scheduler_fire_times_out_idle_session() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;
    advance_to_vote(&h, sid).await;

    h.clock.advance(Duration::seconds(3601));
    let fired = h.scheduler.fire_due(h.clock.now()).await.unwrap();
    assert_eq!(fired, 1);

    let state = h.orchestrator.get_session_state(sid).await.unwrap();
    assert_eq!(
        state.phase,
        SessionPhase::Complete {
            outcome: Outcome::Escalate
        }
    );

    // Late fires are no-ops
    h.scheduler.fire(sid).await.unwrap();
    assert_eq!(h.bus.for_session(sid).len(), 1);
}

#[tokio::test]
async fn test_deadline_fire_after_completion_is_noop() {
    let h = harness(5);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;
    vote_round(&h, sid, [Outcome::Acknowledge; 3]).await;

    h.clock.advance(Duration::seconds(7200));
    h.scheduler.fire(sid).await.unwrap();

    let state = h.orchestrator.get_session_state(sid).await.unwrap();
    assert_eq!(state.termination_reason, Some(TerminationReason::Supermajority));
    assert_eq!(state.outcome, Some(Outcome::Acknowledge));
    assert_eq!(h.bus.for_session(sid).len(), 1);
}

// ── Substitution ───────────────────────────────────────────────────

#[tokio::test]
async fn test_single_substitution_then_completion() {
    let h = harness(6);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    h.orchestrator
        .complete_phase(sid, Phase::Assess, vec![TranscriptEntry::new("J1", "ok")])
        .await
        .unwrap();

    let failed = summary.panel[1].clone();
    let state = h.orchestrator.report_juror_failure(sid, &failed).await.unwrap();
    assert_eq!(state.phase, SessionPhase::Position);
    assert_eq!(state.substitutions, 1);
    assert!(!state.panel.contains(&failed));
    assert_eq!(state.panel[0], summary.panel[0]);
    assert_eq!(state.panel[2], summary.panel[2]);

    // The replacement is the next juror in the assignment stream
    let expected: Vec<String> = PanelSelector::default()
        .candidates("P1", None, summary.pool_generation, &pool_of(6))
        .collect();
    assert_eq!(state.panel[1], expected[3]);

    // The removed juror can no longer vote
    advance_to_vote(&h, sid).await;
    assert!(h
        .orchestrator
        .submit_vote(sid, &failed, Outcome::Refer, "gone")
        .await
        .is_err());

    let state = vote_round(&h, sid, [Outcome::Refer; 3]).await;
    assert_eq!(state.outcome, Some(Outcome::Refer));

    let timeline = h.orchestrator.reconstruct_audit(sid).await.unwrap();
    assert!(timeline.verification.is_valid);
}

#[tokio::test]
async fn test_second_failure_aborts_with_witnesses_intact() {
    let h = harness(8);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    h.orchestrator
        .complete_phase(sid, Phase::Assess, vec![TranscriptEntry::new("J1", "ok")])
        .await
        .unwrap();
    let state = h
        .orchestrator
        .report_juror_failure(sid, &summary.panel[0])
        .await
        .unwrap();
    h.orchestrator
        .complete_phase(sid, Phase::Position, vec![TranscriptEntry::new("J1", "ok")])
        .await
        .unwrap();

    let state = h
        .orchestrator
        .report_juror_failure(sid, &state.panel[2])
        .await
        .unwrap();
    assert_eq!(
        state.phase,
        SessionPhase::Aborted {
            reason: TerminationReason::RepeatedPanelFailure
        }
    );
    assert_eq!(state.outcome, None);

    let timeline = h.orchestrator.reconstruct_audit(sid).await.unwrap();
    assert_eq!(timeline.witness_count(), 2);
    assert!(timeline.verification.is_valid);
    assert!(timeline.is_partial());

    let dispositions = h.bus.for_session(sid);
    assert_eq!(dispositions.len(), 1);
    assert_eq!(dispositions[0].outcome, None);

    // Aborted sessions accept nothing further
    assert!(h
        .orchestrator
        .complete_phase(sid, Phase::CrossExamine, vec![])
        .await
        .is_err());
}

#[tokio::test]
async fn test_empty_replacement_pool_aborts() {
    let h = harness(3);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();

    let state = h
        .orchestrator
        .report_juror_failure(&summary.session_id, &summary.panel[0])
        .await
        .unwrap();
    assert_eq!(
        state.phase,
        SessionPhase::Aborted {
            reason: TerminationReason::ReplacementPoolExhausted
        }
    );
}

#[tokio::test]
async fn test_round_scoped_budget_allows_one_per_round() {
    let config = DeliberationConfig {
        substitution_scope: "round".parse().unwrap(),
        ..Default::default()
    };
    let h = harness_with(config, 9);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let sid = &summary.session_id;

    let state = h
        .orchestrator
        .report_juror_failure(sid, &summary.panel[0])
        .await
        .unwrap();
    assert_eq!(state.substitutions, 1);

    vote_round(&h, sid, SPLIT).await;

    let state = h
        .orchestrator
        .report_juror_failure(sid, &state.panel[1])
        .await
        .unwrap();
    assert_eq!(state.substitutions, 2);
    assert_eq!(state.phase, SessionPhase::CrossExamine);
}

#[tokio::test]
async fn test_failure_of_unseated_juror_rejected() {
    let h = harness(6);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();
    let outsider = (1..=6)
        .map(|i| format!("J{}", i))
        .find(|j| !summary.panel.contains(j))
        .unwrap();

    let err = h
        .orchestrator
        .report_juror_failure(&summary.session_id, &outsider)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliberationError::JurorNotOnPanel { .. }));
}

#[tokio::test]
async fn test_pool_change_does_not_move_existing_panel() {
    let h = harness(6);
    let summary = h.orchestrator.assign_panel("P1").await.unwrap();

    h.pool.replace(pool_of(12).jurors).unwrap();

    let state = h
        .orchestrator
        .get_session_state(&summary.session_id)
        .await
        .unwrap();
    assert_eq!(state.panel, summary.panel);

    // Re-requesting the petition returns the original assignment
    let again = h.orchestrator.assign_panel("P1").await.unwrap();
    assert_eq!(again, summary);
}
