//! Session orchestrator: drives panels from assignment to disposition.
//!
//! Ties together panel selection, witnessing, consensus, substitution and
//! the timeout monitor. Every mutating operation on a session runs under
//! that session's async lock, checks terminal state, then checks the
//! deadline, and only then applies its own transition. Distinct sessions
//! never contend.
//!
//! The lock only serializes callers inside one process. Several
//! orchestrators may share a ledger, so a cached session is brought up to
//! the ledger head on every lock and records are appended conditionally on
//! the head the caller validated against.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{DeliberationSession, SessionPhase};
use crate::audit::{AuditExport, AuditReconstructor, AuditTimeline};
use crate::config::DeliberationConfig;
use crate::consensus::{ConsensusResolver, DeadlockHandler, RoundDecision};
use crate::disposition::{DispositionBus, DispositionRecord, DispositionSink};
use crate::error::{DeliberationError, DeliberationResult};
use crate::panel::{JurorPoolProvider, PanelSelector, PANEL_SIZE};
use crate::state::{
    AssignmentRecord, DissentRecord, InMemoryLedger, InMemoryTranscriptStore, JurorId, Ledger,
    LedgerError, LedgerRecord, Outcome, PetitionId, Phase, PhaseTranscript, PoolGeneration,
    RecordFilter, RecordKind, RecordPayload, RoundAdvance, SessionId, TerminationReason,
    TerminationRecord, TranscriptEntry, TranscriptStore, Vote, VoteTally,
};
use crate::substitution::{SubstitutionCoordinator, SubstitutionDecision};
use crate::timeout::{
    Clock, DeadlineHandler, Scheduler, SchedulerResult, SystemClock, TimeoutCheck, TimeoutMonitor,
    TokioScheduler,
};
use crate::witness::WitnessChainBuilder;

/// External services the orchestrator consumes
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub pool: Arc<dyn JurorPoolProvider>,
    pub scheduler: Arc<dyn Scheduler>,
    pub sink: Arc<dyn DispositionSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory stores, a disposition bus, the system clock and a tokio
    /// scheduler.
    pub fn in_memory(pool: Arc<dyn JurorPoolProvider>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            ledger: Arc::new(InMemoryLedger::new()),
            transcripts: Arc::new(InMemoryTranscriptStore::new()),
            pool,
            scheduler: Arc::new(TokioScheduler::new(clock.clone())),
            sink: Arc::new(DispositionBus::new()),
            clock,
        }
    }
}

/// Result of `assign_panel`. Identical for every caller of the same petition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub petition_id: PetitionId,
    pub panel: Vec<JurorId>,
    pub pool_generation: PoolGeneration,
    pub deadline: DateTime<Utc>,
}

impl SessionSummary {
    fn from_assignment(record: &LedgerRecord) -> DeliberationResult<Self> {
        match &record.payload {
            RecordPayload::SessionAssigned(AssignmentRecord {
                panel,
                pool_generation,
                deadline,
                ..
            }) => Ok(Self {
                session_id: record.session_id.clone(),
                petition_id: record.petition_id.clone(),
                panel: panel.clone(),
                pool_generation: *pool_generation,
                deadline: *deadline,
            }),
            _ => Err(DeliberationError::invalid_transition(
                &record.session_id,
                format!("expected an assignment record, got {}", record.kind()),
            )),
        }
    }
}

/// Queryable view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub petition_id: PetitionId,
    pub panel: Vec<JurorId>,
    pub phase: SessionPhase,
    pub round: u32,
    pub max_rounds: u32,
    pub outcome: Option<Outcome>,
    pub termination_reason: Option<TerminationReason>,
    pub dissent: Option<DissentRecord>,
    pub deadline: DateTime<Utc>,
    pub substitutions: usize,
    /// Ballots counted so far in the current round
    pub ballots_in_round: usize,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

impl From<&DeliberationSession> for SessionState {
    fn from(session: &DeliberationSession) -> Self {
        Self {
            session_id: session.id.clone(),
            petition_id: session.petition_id.clone(),
            panel: session.panel.to_vec(),
            phase: session.phase,
            round: session.round,
            max_rounds: session.max_rounds,
            outcome: session.outcome(),
            termination_reason: session.termination.as_ref().map(|t| t.reason),
            dissent: session.termination.as_ref().and_then(|t| t.dissent.clone()),
            deadline: session.deadline,
            substitutions: session.substitutions.len(),
            ballots_in_round: session.current_ballots().len(),
        }
    }
}

type SessionSlot = Arc<AsyncMutex<Option<DeliberationSession>>>;

/// Attempts at scheduling a new session's deadline
const ARM_ATTEMPTS: u32 = 3;

/// Backoff between scheduling attempts, multiplied by the attempt number
const ARM_BACKOFF: Duration = Duration::from_millis(20);

/// Forwards scheduler fires to the orchestrator without keeping it alive
struct DeadlineHook {
    orchestrator: Weak<SessionOrchestrator>,
}

#[async_trait]
impl DeadlineHandler for DeadlineHook {
    async fn on_deadline(&self, session_id: &str) {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            debug!(session_id, "Orchestrator gone; deadline dropped");
            return;
        };
        if let Err(e) = orchestrator.handle_deadline(session_id).await {
            error!(session_id, error = %e, code = e.code(), "Deadline handling failed");
        }
    }
}

/// Drives deliberation sessions.
///
/// Live sessions are cached after first load, caught up with the ledger on
/// every access, and evicted once terminal, so the ledger stays the source
/// of truth.
pub struct SessionOrchestrator {
    config: DeliberationConfig,
    ledger: Arc<dyn Ledger>,
    pool: Arc<dyn JurorPoolProvider>,
    sink: Arc<dyn DispositionSink>,
    selector: PanelSelector,
    witness: WitnessChainBuilder,
    resolver: ConsensusResolver,
    substitution: SubstitutionCoordinator,
    timeout: TimeoutMonitor,
    audit: AuditReconstructor,
    sessions: Mutex<HashMap<SessionId, SessionSlot>>,
    /// Assigned sessions whose deadline could not be scheduled
    unarmed: Mutex<HashSet<SessionId>>,
    deadline_hook: Arc<dyn DeadlineHandler>,
}

impl SessionOrchestrator {
    /// Validate the configuration and build a shared orchestrator.
    pub fn new(
        config: DeliberationConfig,
        collaborators: Collaborators,
    ) -> DeliberationResult<Arc<Self>> {
        config.validate()?;

        let selector = PanelSelector::new(config.eligibility_policy());
        let witness = WitnessChainBuilder::new(collaborators.transcripts.clone());

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| Self {
            ledger: collaborators.ledger.clone(),
            pool: collaborators.pool,
            sink: collaborators.sink,
            substitution: SubstitutionCoordinator::new(
                selector.clone(),
                config.max_substitutions,
                config.substitution_scope,
            ),
            selector,
            audit: AuditReconstructor::new(collaborators.ledger, witness.clone()),
            witness,
            resolver: ConsensusResolver::new(),
            timeout: TimeoutMonitor::new(
                collaborators.scheduler,
                collaborators.clock,
                config.session_timeout(),
            ),
            sessions: Mutex::new(HashMap::new()),
            unarmed: Mutex::new(HashSet::new()),
            deadline_hook: Arc::new(DeadlineHook {
                orchestrator: weak.clone(),
            }),
            config,
        }))
    }

    pub fn config(&self) -> &DeliberationConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Assignment
    // ---------------------------------------------------------------------

    /// Get-or-create the session for a petition.
    ///
    /// Exactly one session wins per petition; the ledger's uniqueness
    /// constraint settles concurrent calls and every loser returns the
    /// winner's summary.
    ///
    /// If the deadline cannot be scheduled the assignment stays recorded and
    /// a scheduler error is returned; calling again for the same petition
    /// retries the scheduling.
    pub async fn assign_panel(&self, petition_id: &str) -> DeliberationResult<SessionSummary> {
        let existing = self
            .ledger
            .read(&RecordFilter::petition(petition_id).with_kind(RecordKind::SessionAssigned))
            .await?;
        if let Some(record) = existing.first() {
            debug!(petition_id, session_id = %record.session_id, "Petition already assigned");
            let summary = SessionSummary::from_assignment(record)?;
            if self.is_unarmed(&summary.session_id) {
                self.arm_new_session(&summary.session_id, summary.deadline)
                    .await?;
            }
            return Ok(summary);
        }

        let pool = self.pool.snapshot().await?;
        let seed = self.config.selection_seed.as_deref();
        let panel = self
            .selector
            .select(petition_id, seed, &pool)
            .map_err(|e| DeliberationError::PoolExhausted {
                available: e.available,
                required: e.required,
            })?;

        let now = self.timeout.now();
        let deadline = self.timeout.deadline_for(now);
        let session_id = format!("sess-{}", Uuid::new_v4());
        let mut record = LedgerRecord::new(
            &session_id,
            petition_id,
            now,
            RecordPayload::SessionAssigned(AssignmentRecord {
                panel: panel.to_vec(),
                pool_generation: pool.generation,
                seed: self.config.selection_seed.clone(),
                max_rounds: self.config.max_rounds,
                deadline,
            }),
        );

        match self.ledger.append(record.clone()).await {
            Ok(sequence) => {
                record.sequence = sequence;
                info!(
                    session_id = %session_id,
                    petition_id,
                    panel = %panel,
                    generation = pool.generation,
                    "Panel assigned"
                );
                self.arm_new_session(&session_id, deadline).await?;
                SessionSummary::from_assignment(&record)
            }
            Err(LedgerError::Duplicate { existing, .. }) => {
                info!(
                    petition_id,
                    session_id = %existing.session_id,
                    "Concurrent assignment lost; returning existing session"
                );
                SessionSummary::from_assignment(&existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Phase progression
    // ---------------------------------------------------------------------

    /// Witness the current phase and advance to the next.
    ///
    /// VOTE cannot be completed here; it closes when its third ballot arrives.
    pub async fn complete_phase(
        &self,
        session_id: &str,
        phase: Phase,
        entries: Vec<TranscriptEntry>,
    ) -> DeliberationResult<SessionState> {
        let mut guard = self.lock_session(session_id).await?;
        let session = loaded(&mut guard, session_id)?;
        ensure_live(session)?;

        let now = self.timeout.now();
        if self.expire_if_due(session, now).await? {
            return Ok(self.settle(session));
        }

        if phase == Phase::Vote {
            return Err(DeliberationError::invalid_transition(
                session_id,
                "VOTE completes when the round's third ballot is cast",
            ));
        }
        if session.phase.active() != Some(phase) {
            return Err(DeliberationError::invalid_transition(
                session_id,
                format!("cannot complete {}; session is in {}", phase, session.phase),
            ));
        }

        let transcript = PhaseTranscript {
            session_id: session.id.clone(),
            phase,
            round: session.round,
            entries,
        };
        let event = self
            .witness
            .witness(&transcript, session.last_witness(), now)
            .await?;
        self.commit(session, now, RecordPayload::PhaseWitnessed(event))
            .await?;

        info!(
            session_id,
            phase = %phase,
            round = session.round,
            next = %session.phase,
            "Phase completed"
        );
        Ok(self.settle(session))
    }

    /// Record a ballot; the third ballot of a round closes it.
    pub async fn submit_vote(
        &self,
        session_id: &str,
        juror_id: &str,
        outcome: Outcome,
        rationale: impl Into<String>,
    ) -> DeliberationResult<SessionState> {
        let mut guard = self.lock_session(session_id).await?;
        let session = loaded(&mut guard, session_id)?;
        ensure_live(session)?;

        let now = self.timeout.now();
        if self.expire_if_due(session, now).await? {
            return Ok(self.settle(session));
        }

        let vote = Vote {
            round: session.round,
            juror_id: juror_id.to_string(),
            outcome,
            rationale: rationale.into(),
            cast_at: now,
        };
        self.commit(session, now, RecordPayload::BallotCast(vote))
            .await?;
        debug!(
            session_id,
            juror_id,
            outcome = %outcome,
            round = session.round,
            "Ballot cast"
        );

        if session.current_ballots().len() == PANEL_SIZE {
            self.close_round(session, now).await?;
        }
        Ok(self.settle(session))
    }

    /// Witness the VOTE transcript, resolve it, and act on the decision.
    async fn close_round(
        &self,
        session: &mut DeliberationSession,
        now: DateTime<Utc>,
    ) -> DeliberationResult<()> {
        let mut ballots: Vec<Vote> = session.current_ballots().into_iter().cloned().collect();
        ballots.sort_by(|a, b| a.juror_id.cmp(&b.juror_id));

        let mut entries = Vec::with_capacity(ballots.len());
        for vote in &ballots {
            entries.push(TranscriptEntry::new(
                vote.juror_id.clone(),
                serde_json::to_string(vote)?,
            ));
        }
        let transcript = PhaseTranscript {
            session_id: session.id.clone(),
            phase: Phase::Vote,
            round: session.round,
            entries,
        };
        let event = self
            .witness
            .witness(&transcript, session.last_witness(), now)
            .await?;
        self.commit(session, now, RecordPayload::PhaseWitnessed(event))
            .await?;

        // The round limit is fixed per session at assignment
        let resolution = self.resolver.resolve(&ballots);
        let decision =
            DeadlockHandler::new(session.max_rounds).evaluate(session.round, &resolution);
        debug!(
            session_id = %session.id,
            round = session.round,
            resolution = %resolution,
            decision = %decision,
            "Round closed"
        );

        match decision {
            RoundDecision::Resolved {
                outcome,
                tally,
                dissent,
            } => {
                self.terminate(
                    session,
                    now,
                    Some(outcome),
                    TerminationReason::Supermajority,
                    Some(tally),
                    dissent,
                )
                .await
            }
            RoundDecision::NextRound {
                from_round,
                to_round,
                tally,
            } => {
                self.commit(
                    session,
                    now,
                    RecordPayload::RoundAdvanced(RoundAdvance {
                        from_round,
                        to_round,
                        tally: tally.clone(),
                    }),
                )
                .await?;
                info!(
                    session_id = %session.id,
                    tally = %tally,
                    round = to_round,
                    "Three-way split; returning to CROSS_EXAMINE"
                );
                Ok(())
            }
            RoundDecision::Deadlocked { rounds, tally } => {
                warn!(
                    session_id = %session.id,
                    rounds,
                    tally = %tally,
                    "Deadlock; escalating"
                );
                self.terminate(
                    session,
                    now,
                    Some(DeadlockHandler::DEADLOCK_OUTCOME),
                    TerminationReason::Deadlock,
                    Some(tally),
                    None,
                )
                .await
            }
            RoundDecision::AwaitingBallots => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Failure handling
    // ---------------------------------------------------------------------

    /// Handle a juror dropping out mid-session.
    ///
    /// An exhausted budget or an empty replacement pool aborts the session;
    /// both are reported through the returned state, not as errors.
    pub async fn report_juror_failure(
        &self,
        session_id: &str,
        juror_id: &str,
    ) -> DeliberationResult<SessionState> {
        let mut guard = self.lock_session(session_id).await?;
        let session = loaded(&mut guard, session_id)?;
        ensure_live(session)?;

        let now = self.timeout.now();
        if self.expire_if_due(session, now).await? {
            return Ok(self.settle(session));
        }

        let pool = self.pool.snapshot().await?;
        match self.substitution.decide(session, juror_id, &pool, now) {
            Ok(SubstitutionDecision::Replace(record)) => {
                let replacement = record.replacement_juror.clone();
                self.commit(session, now, RecordPayload::JurorSubstituted(record))
                    .await?;
                info!(
                    session_id,
                    failed_juror = juror_id,
                    replacement = %replacement,
                    phase = %session.phase,
                    round = session.round,
                    "Juror substituted"
                );
            }
            Ok(SubstitutionDecision::NoCandidate) => {
                warn!(session_id, failed_juror = juror_id, "No replacement juror available");
                self.terminate(
                    session,
                    now,
                    None,
                    TerminationReason::ReplacementPoolExhausted,
                    None,
                    None,
                )
                .await?;
            }
            Err(DeliberationError::SubstitutionBudgetExceeded { failures, .. }) => {
                warn!(session_id, failed_juror = juror_id, failures, "Repeated panel failure");
                self.terminate(
                    session,
                    now,
                    None,
                    TerminationReason::RepeatedPanelFailure,
                    None,
                    None,
                )
                .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(self.settle(session))
    }

    /// Deadline callback. Idempotent: a terminal session is a no-op and an
    /// early fire schedules the check again for the recorded deadline.
    pub async fn handle_deadline(&self, session_id: &str) -> DeliberationResult<SessionState> {
        let mut guard = self.lock_session(session_id).await?;
        let session = loaded(&mut guard, session_id)?;

        match self.timeout.check(session.deadline, session.is_terminal()) {
            TimeoutCheck::AlreadyTerminal => {
                debug!(session_id, phase = %session.phase, "Deadline fired for finished session");
            }
            TimeoutCheck::NotYetDue => {
                warn!(
                    session_id,
                    deadline = %session.deadline.to_rfc3339(),
                    "Deadline fired early; re-arming"
                );
                self.timeout
                    .arm(session_id, session.deadline, self.deadline_hook.clone())
                    .await?;
            }
            TimeoutCheck::Expired => {
                let now = self.timeout.now();
                self.terminate_timeout(session, now).await?;
            }
        }
        Ok(self.settle(session))
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn get_session_state(&self, session_id: &str) -> DeliberationResult<SessionState> {
        let mut guard = self.lock_session(session_id).await?;
        let session = loaded(&mut guard, session_id)?;
        Ok(self.settle(session))
    }

    pub async fn reconstruct_audit(&self, session_id: &str) -> DeliberationResult<AuditTimeline> {
        self.audit.reconstruct(session_id).await
    }

    /// Records plus transcripts of a session, for offline verification.
    pub async fn export_audit(&self, session_id: &str) -> DeliberationResult<AuditExport> {
        let export = AuditExport::collect(
            self.ledger.as_ref(),
            self.witness.transcripts().as_ref(),
            session_id,
        )
        .await?;
        if export.records.is_empty() {
            return Err(DeliberationError::SessionNotFound(session_id.to_string()));
        }
        Ok(export)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn slot(&self, session_id: &str) -> SessionSlot {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Number of sessions held in the in-process cache.
    pub fn cached_sessions(&self) -> usize {
        self.sessions
            .lock()
            .map(|sessions| sessions.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    fn forget(&self, session_id: &str) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.remove(session_id);
    }

    /// Take the session lock and bring the session up to the ledger head.
    async fn lock_session(
        &self,
        session_id: &str,
    ) -> DeliberationResult<OwnedMutexGuard<Option<DeliberationSession>>> {
        let mut guard = self.slot(session_id).lock_owned().await;
        let synced = match guard.as_mut() {
            Some(session) => self.refresh(session).await.map(|_| ()),
            None => self.replay(session_id).await.map(|session| *guard = session),
        };
        if let Err(e) = synced {
            // Drop the cached copy; the next access replays from scratch
            *guard = None;
            drop(guard);
            self.forget(session_id);
            return Err(e);
        }

        let Some(terminal) = guard.as_ref().map(DeliberationSession::is_terminal) else {
            drop(guard);
            self.forget(session_id);
            return Err(DeliberationError::SessionNotFound(session_id.to_string()));
        };
        // Terminal sessions accept nothing further; later reads replay
        if terminal {
            self.forget(session_id);
        }
        Ok(guard)
    }

    async fn replay(&self, session_id: &str) -> DeliberationResult<Option<DeliberationSession>> {
        let records = self.ledger.read(&RecordFilter::session(session_id)).await?;
        DeliberationSession::replay(&records)
    }

    /// Apply records other writers appended since this copy was last synced.
    async fn refresh(&self, session: &mut DeliberationSession) -> DeliberationResult<usize> {
        let tail = self
            .ledger
            .read(&RecordFilter::session(&session.id).after(session.last_sequence))
            .await?;
        if tail.is_empty() {
            return Ok(0);
        }

        let mut next = session.clone();
        for record in &tail {
            next.apply(record)?;
        }
        debug!(
            session_id = %session.id,
            records = tail.len(),
            from = session.last_sequence,
            to = next.last_sequence,
            "Cached session caught up with ledger"
        );
        *session = next;
        Ok(tail.len())
    }

    /// Validate a record against the session, append it, then adopt it.
    ///
    /// The append only succeeds if nothing was written for the session since
    /// it was synced. Otherwise the session is caught up and the operation is
    /// rejected, since it was validated against stale state.
    async fn commit(
        &self,
        session: &mut DeliberationSession,
        now: DateTime<Utc>,
        payload: RecordPayload,
    ) -> DeliberationResult<u64> {
        let record = LedgerRecord::new(&session.id, &session.petition_id, now, payload);
        let mut next = session.clone();
        next.apply(&record)?;

        match self.ledger.append_after(record, session.last_sequence).await {
            Ok(sequence) => {
                next.last_sequence = sequence;
                *session = next;
                Ok(sequence)
            }
            Err(LedgerError::Conflict {
                expected, found, ..
            }) => {
                warn!(
                    session_id = %session.id,
                    expected,
                    found,
                    "Session changed underneath this writer"
                );
                self.refresh(session).await?;
                Err(DeliberationError::invalid_transition(
                    &session.id,
                    format!(
                        "session advanced to sequence {} concurrently and is now in {}",
                        found, session.phase
                    ),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot for the caller; a terminal session leaves the cache.
    fn settle(&self, session: &DeliberationSession) -> SessionState {
        let state = SessionState::from(session);
        if state.is_terminal() {
            self.forget(&session.id);
        }
        state
    }

    fn is_unarmed(&self, session_id: &str) -> bool {
        self.unarmed
            .lock()
            .map(|unarmed| unarmed.contains(session_id))
            .unwrap_or_else(|poisoned| poisoned.into_inner().contains(session_id))
    }

    /// Schedule a new session's deadline, retrying transient failures.
    ///
    /// Sessions that could not be armed are remembered so a repeated
    /// assignment call retries.
    async fn arm_new_session(
        &self,
        session_id: &str,
        deadline: DateTime<Utc>,
    ) -> DeliberationResult<()> {
        let result = self.arm_with_retry(session_id, deadline).await;
        let mut unarmed = self
            .unarmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match result {
            Ok(()) => {
                unarmed.remove(session_id);
                Ok(())
            }
            Err(e) => {
                error!(
                    session_id,
                    error = %e,
                    attempts = ARM_ATTEMPTS,
                    "Failed to schedule deadline"
                );
                unarmed.insert(session_id.to_string());
                Err(e.into())
            }
        }
    }

    async fn arm_with_retry(
        &self,
        session_id: &str,
        deadline: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut attempt = 1;
        loop {
            match self
                .timeout
                .arm(session_id, deadline, self.deadline_hook.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < ARM_ATTEMPTS => {
                    warn!(session_id, attempt, error = %e, "Deadline scheduling failed; retrying");
                    tokio::time::sleep(ARM_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Terminate with TIMEOUT if the deadline has passed.
    async fn expire_if_due(
        &self,
        session: &mut DeliberationSession,
        now: DateTime<Utc>,
    ) -> DeliberationResult<bool> {
        if self.timeout.check(session.deadline, session.is_terminal()) != TimeoutCheck::Expired {
            return Ok(false);
        }
        self.terminate_timeout(session, now).await?;
        Ok(true)
    }

    async fn terminate_timeout(
        &self,
        session: &mut DeliberationSession,
        now: DateTime<Utc>,
    ) -> DeliberationResult<()> {
        warn!(
            session_id = %session.id,
            phase = %session.phase,
            round = session.round,
            "Session deadline reached"
        );
        let tally = session.current_tally();
        let partial = (tally.total() > 0).then_some(tally);
        self.terminate(
            session,
            now,
            Some(Outcome::Escalate),
            TerminationReason::Timeout,
            partial,
            None,
        )
        .await
    }

    async fn terminate(
        &self,
        session: &mut DeliberationSession,
        now: DateTime<Utc>,
        outcome: Option<Outcome>,
        reason: TerminationReason,
        final_tally: Option<VoteTally>,
        dissent: Option<DissentRecord>,
    ) -> DeliberationResult<()> {
        let termination = TerminationRecord {
            outcome,
            reason,
            round_count: session.round,
            final_tally,
            dissent,
            terminated_at: now,
        };
        let disposition =
            DispositionRecord::from_termination(&session.id, &session.petition_id, &termination);
        self.commit(session, now, RecordPayload::SessionTerminated(termination))
            .await?;

        info!(
            session_id = %session.id,
            petition_id = %session.petition_id,
            status = %session.phase,
            reason = %reason,
            round = session.round,
            "Session terminated"
        );

        // The terminal record is already durable; delivery failure is logged
        if let Err(e) = self.sink.emit(disposition).await {
            warn!(session_id = %session.id, error = %e, "Failed to emit disposition");
        }
        Ok(())
    }
}

fn loaded<'a>(
    guard: &'a mut OwnedMutexGuard<Option<DeliberationSession>>,
    session_id: &str,
) -> DeliberationResult<&'a mut DeliberationSession> {
    guard
        .as_mut()
        .ok_or_else(|| DeliberationError::SessionNotFound(session_id.to_string()))
}

fn ensure_live(session: &DeliberationSession) -> DeliberationResult<()> {
    if session.is_terminal() {
        return Err(DeliberationError::invalid_transition(
            &session.id,
            format!("session is {} and accepts no further operations", session.phase),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::{JurorPool, StaticPoolProvider};
    use crate::timeout::{ManualClock, ManualScheduler, SchedulerError};
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        orchestrator: Arc<SessionOrchestrator>,
        clock: Arc<ManualClock>,
        scheduler: Arc<ManualScheduler>,
        bus: Arc<DispositionBus>,
    }

    fn harness(pool_size: usize) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let bus = Arc::new(DispositionBus::new());
        let pool = JurorPool::from_ids((1..=pool_size).map(|i| format!("J{}", i)), 1);
        let orchestrator = SessionOrchestrator::new(
            DeliberationConfig::default(),
            Collaborators {
                ledger: Arc::new(InMemoryLedger::new()),
                transcripts: Arc::new(InMemoryTranscriptStore::new()),
                pool: Arc::new(StaticPoolProvider::new(pool)),
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
        }
    }

    async fn to_vote(orchestrator: &SessionOrchestrator, session_id: &str) {
        for phase in [Phase::Assess, Phase::Position, Phase::CrossExamine] {
            orchestrator
                .complete_phase(session_id, phase, vec![TranscriptEntry::new("J1", "noted")])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_assign_arms_one_deadline() {
        let h = harness(5);
        let summary = h.orchestrator.assign_panel("P1").await.unwrap();
        let again = h.orchestrator.assign_panel("P1").await.unwrap();

        assert_eq!(summary, again);
        assert_eq!(h.scheduler.scheduled().len(), 1);
        assert_eq!(h.scheduler.scheduled()[0].1, summary.deadline);
    }

    #[tokio::test]
    async fn test_pool_too_small() {
        let h = harness(2);
        let err = h.orchestrator.assign_panel("P1").await.unwrap_err();
        assert!(matches!(
            err,
            DeliberationError::PoolExhausted {
                available: 2,
                required: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_vote_phase_not_completable_directly() {
        let h = harness(5);
        let summary = h.orchestrator.assign_panel("P1").await.unwrap();
        to_vote(&h.orchestrator, &summary.session_id).await;

        let err = h
            .orchestrator
            .complete_phase(&summary.session_id, Phase::Vote, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_supermajority_emits_one_disposition() {
        let h = harness(5);
        let summary = h.orchestrator.assign_panel("P1").await.unwrap();
        let sid = summary.session_id.clone();
        to_vote(&h.orchestrator, &sid).await;

        let [a, b, c] = [&summary.panel[0], &summary.panel[1], &summary.panel[2]];
        h.orchestrator.submit_vote(&sid, a, Outcome::Refer, "route").await.unwrap();
        h.orchestrator.submit_vote(&sid, b, Outcome::Refer, "route").await.unwrap();
        let state = h
            .orchestrator
            .submit_vote(&sid, c, Outcome::Acknowledge, "fine as is")
            .await
            .unwrap();

        assert_eq!(state.outcome, Some(Outcome::Refer));
        assert_eq!(state.termination_reason, Some(TerminationReason::Supermajority));
        assert_eq!(state.dissent.unwrap().juror_id, *c);
        assert_eq!(h.bus.for_session(&sid).len(), 1);

        // Terminal sessions reject further mutation
        assert!(h
            .orchestrator
            .complete_phase(&sid, Phase::Assess, vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_expired_session_times_out_on_next_operation() {
        let h = harness(5);
        let summary = h.orchestrator.assign_panel("P1").await.unwrap();
        h.clock.advance(Duration::seconds(3600));

        let state = h
            .orchestrator
            .complete_phase(&summary.session_id, Phase::Assess, vec![])
            .await
            .unwrap();
        assert_eq!(state.termination_reason, Some(TerminationReason::Timeout));
        assert_eq!(state.outcome, Some(Outcome::Escalate));
    }

    #[tokio::test]
    async fn test_deadline_fire_is_idempotent_and_rearms_early_fire() {
        let h = harness(5);
        let summary = h.orchestrator.assign_panel("P1").await.unwrap();

        // Early: the session stays live and the check is scheduled again
        assert_eq!(h.scheduler.fire(&summary.session_id).await.unwrap(), 1);
        let state = h.orchestrator.get_session_state(&summary.session_id).await.unwrap();
        assert_eq!(state.phase, SessionPhase::Assess);
        let scheduled = h.scheduler.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert!(scheduled.iter().all(|(_, at)| *at == summary.deadline));

        h.clock.advance(Duration::seconds(3601));
        h.scheduler.fire(&summary.session_id).await.unwrap();
        h.scheduler.fire(&summary.session_id).await.unwrap();

        let state = h.orchestrator.get_session_state(&summary.session_id).await.unwrap();
        assert_eq!(state.termination_reason, Some(TerminationReason::Timeout));
        assert_eq!(h.bus.for_session(&summary.session_id).len(), 1);
    }

    #[tokio::test]
    async fn test_early_fire_does_not_lose_the_deadline() {
        let h = harness(5);
        let summary = h.orchestrator.assign_panel("P1").await.unwrap();

        // A scheduler that drops what it delivers still has the re-armed check
        h.clock.advance(Duration::seconds(10));
        assert_eq!(h.scheduler.fire_due(summary.deadline).await.unwrap(), 1);
        assert_eq!(h.scheduler.scheduled().len(), 1);

        h.clock.advance(Duration::seconds(3600));
        assert_eq!(h.scheduler.fire_due(h.clock.now()).await.unwrap(), 1);

        let state = h.orchestrator.get_session_state(&summary.session_id).await.unwrap();
        assert_eq!(state.termination_reason, Some(TerminationReason::Timeout));
        assert_eq!(state.outcome, Some(Outcome::Escalate));
    }

    /// Fails the first `failures` calls, then records like a manual scheduler.
    struct FlakyScheduler {
        failures: AtomicU32,
        attempts: AtomicU32,
        inner: ManualScheduler,
    }

    #[async_trait]
    impl Scheduler for FlakyScheduler {
        async fn schedule(
            &self,
            session_id: &str,
            fire_at: DateTime<Utc>,
            handler: Arc<dyn DeadlineHandler>,
        ) -> SchedulerResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SchedulerError::Unavailable("timer wheel full".into()));
            }
            self.inner.schedule(session_id, fire_at, handler).await
        }
    }

    fn flaky_orchestrator(failures: u32) -> (Arc<SessionOrchestrator>, Arc<FlakyScheduler>) {
        let scheduler = Arc::new(FlakyScheduler {
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            inner: ManualScheduler::new(),
        });
        let orchestrator = SessionOrchestrator::new(
            DeliberationConfig::default(),
            Collaborators {
                ledger: Arc::new(InMemoryLedger::new()),
                transcripts: Arc::new(InMemoryTranscriptStore::new()),
                pool: Arc::new(StaticPoolProvider::new(JurorPool::from_ids(
                    ["J1", "J2", "J3", "J4"],
                    1,
                ))),
                scheduler: scheduler.clone(),
                sink: Arc::new(DispositionBus::new()),
                clock: Arc::new(ManualClock::default()),
            },
        )
        .unwrap();
        (orchestrator, scheduler)
    }

    #[tokio::test]
    async fn test_transient_scheduler_failure_is_retried() {
        let (orchestrator, scheduler) = flaky_orchestrator(2);
        let summary = orchestrator.assign_panel("P1").await.unwrap();

        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.inner.scheduled().len(), 1);
        assert_eq!(scheduler.inner.scheduled()[0].0, summary.session_id);
    }

    #[tokio::test]
    async fn test_unschedulable_deadline_surfaces_and_is_retried_on_reassign() {
        let (orchestrator, scheduler) = flaky_orchestrator(ARM_ATTEMPTS);

        let err = orchestrator.assign_panel("P1").await.unwrap_err();
        assert_eq!(err.code(), "SCHEDULER");
        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), ARM_ATTEMPTS);
        assert!(scheduler.inner.scheduled().is_empty());

        // The assignment itself is recorded; asking again arms it
        let summary = orchestrator.assign_panel("P1").await.unwrap();
        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), ARM_ATTEMPTS + 1);
        assert_eq!(scheduler.inner.scheduled().len(), 1);

        // Once armed, further calls do not schedule again
        assert_eq!(orchestrator.assign_panel("P1").await.unwrap(), summary);
        assert_eq!(scheduler.inner.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_sessions_leave_the_cache() {
        let h = harness(5);
        let summary = h.orchestrator.assign_panel("P1").await.unwrap();
        let sid = summary.session_id.clone();
        to_vote(&h.orchestrator, &sid).await;
        assert_eq!(h.orchestrator.cached_sessions(), 1);

        for juror in &summary.panel {
            h.orchestrator
                .submit_vote(&sid, juror, Outcome::Acknowledge, "fine")
                .await
                .unwrap();
        }
        assert_eq!(h.orchestrator.cached_sessions(), 0);

        // Reads and rejected writes replay without re-populating the cache
        let state = h.orchestrator.get_session_state(&sid).await.unwrap();
        assert_eq!(state.outcome, Some(Outcome::Acknowledge));
        assert!(h
            .orchestrator
            .report_juror_failure(&sid, &summary.panel[0])
            .await
            .is_err());
        assert_eq!(h.orchestrator.cached_sessions(), 0);
    }

    #[tokio::test]
    async fn test_many_finished_sessions_do_not_accumulate() {
        let h = harness(5);
        for i in 0..20 {
            let summary = h.orchestrator.assign_panel(&format!("P{i}")).await.unwrap();
            h.clock.advance(Duration::seconds(3601));
            h.scheduler.fire(&summary.session_id).await.unwrap();
        }
        assert_eq!(h.orchestrator.cached_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness(5);
        let err = h.orchestrator.get_session_state("sess-missing").await.unwrap_err();
        assert!(matches!(err, DeliberationError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = DeliberationConfig {
            max_rounds: 0,
            ..Default::default()
        };
        let pool = Arc::new(StaticPoolProvider::new(JurorPool::from_ids(["J1"], 1)));
        assert!(SessionOrchestrator::new(config, Collaborators::in_memory(pool)).is_err());
    }
}
