//! Panel deliberation CLI
//!
//! # Usage
//!
//! ```bash
//! # Run a full session against in-memory backends and print its audit timeline
//! deliberation simulate P1 --ballots ACK,ACK,REFER
//!
//! # Three-way split twice, then agreement in round 3
//! deliberation simulate P2 --ballots ACK,REFER,ESC --ballots ACK,REFER,ESC --ballots ESC,ESC,ACK
//!
//! # Show the panel a petition would get
//! deliberation select P1 --jurors J1,J2,J3,J4,J5 --generation 7
//!
//! # Verify an exported audit bundle offline
//! deliberation simulate P1 --ballots ACK,ACK,REFER --export p1.json
//! deliberation verify p1.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use deliberation::audit::AuditReconstructor;
use deliberation::panel::{JurorPool, PanelSelector};
use deliberation::substitution::SubstitutionScope;
use deliberation::witness::WitnessChainBuilder;
use deliberation::{
    AuditExport, Collaborators, DeliberationConfig, Outcome, Phase, SessionOrchestrator,
    StaticPoolProvider, TranscriptEntry,
};
#[cfg(feature = "rocksdb-store")]
use deliberation::{Ledger, TranscriptStore};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (env vars and flags override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Maximum rounds before deadlock (overrides DELIBERATION_MAX_ROUNDS)
    #[arg(long, global = true)]
    max_rounds: Option<u32>,

    /// Session timeout in seconds (overrides DELIBERATION_SESSION_TIMEOUT)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Panel selection seed (overrides DELIBERATION_SELECTION_SEED)
    #[arg(long, global = true)]
    seed: Option<String>,

    /// Substitution budget scope: session or round
    #[arg(long, global = true)]
    substitution_scope: Option<SubstitutionScope>,

    /// RocksDB directory for a durable ledger (requires the rocksdb-store feature)
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one session end to end and print its audit timeline as JSON
    Simulate {
        /// Petition id
        petition: String,

        /// Juror pool, comma separated
        #[arg(long, value_delimiter = ',', default_value = "J1,J2,J3,J4,J5")]
        jurors: Vec<String>,

        /// Ballots for one round in panel seat order; repeat per round
        #[arg(long, required = true)]
        ballots: Vec<String>,

        /// Juror to report as failed before the first phase; repeatable
        #[arg(long)]
        fail: Vec<String>,

        /// Write records and transcripts to this file for `verify`
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Print the deterministic panel for a petition
    Select {
        /// Petition id
        petition: String,

        /// Juror pool, comma separated
        #[arg(long, value_delimiter = ',', default_value = "J1,J2,J3,J4,J5")]
        jurors: Vec<String>,

        /// Pool generation marker
        #[arg(long, default_value_t = 1)]
        generation: u64,
    },

    /// Verify the witness chains in an exported audit bundle
    Verify {
        /// Path to an export written by `simulate --export`
        path: PathBuf,
    },
}

fn load_config(args: &Args) -> Result<DeliberationConfig> {
    let mut config = match &args.config {
        Some(path) => DeliberationConfig::from_toml_file(path)?,
        None => DeliberationConfig::default(),
    };
    config.apply_env();

    if let Some(rounds) = args.max_rounds {
        config.max_rounds = rounds;
    }
    if let Some(timeout) = args.timeout {
        config.session_timeout = timeout;
    }
    if let Some(seed) = &args.seed {
        config.selection_seed = Some(seed.clone());
    }
    if let Some(scope) = args.substitution_scope {
        config.substitution_scope = scope;
    }

    config.validate()?;
    Ok(config)
}

fn collaborators(args: &Args, pool: JurorPool) -> Result<Collaborators> {
    let collaborators = Collaborators::in_memory(Arc::new(StaticPoolProvider::new(pool)));
    match &args.state_path {
        Some(path) => durable(collaborators, path),
        None => Ok(collaborators),
    }
}

/// Swap the in-memory ledger and transcript store for RocksDB.
#[cfg(feature = "rocksdb-store")]
fn durable(collaborators: Collaborators, path: &Path) -> Result<Collaborators> {
    let store = deliberation::state::RocksStore::open(path)
        .with_context(|| format!("opening state store at {}", path.display()))?
        .shared();
    info!("Deliberation state path: {}", path.display());

    let ledger: Arc<dyn Ledger> = store.clone();
    let transcripts: Arc<dyn TranscriptStore> = store;
    Ok(Collaborators {
        ledger,
        transcripts,
        ..collaborators
    })
}

#[cfg(not(feature = "rocksdb-store"))]
fn durable(_collaborators: Collaborators, path: &Path) -> Result<Collaborators> {
    bail!(
        "--state-path {} requires building with the rocksdb-store feature",
        path.display()
    )
}

fn parse_round(round: &str) -> Result<Vec<Outcome>> {
    let outcomes = round
        .split(',')
        .map(|s| s.parse::<Outcome>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    if outcomes.len() != 3 {
        bail!("each --ballots value needs exactly 3 outcomes, got {:?}", round);
    }
    Ok(outcomes)
}

async fn simulate(
    args: &Args,
    petition: &str,
    jurors: &[String],
    ballots: &[String],
    failures: &[String],
    export: Option<&PathBuf>,
) -> Result<()> {
    let config = load_config(args)?;
    let rounds = ballots
        .iter()
        .map(|b| parse_round(b))
        .collect::<Result<Vec<_>>>()?;

    let pool = JurorPool::from_ids(jurors.iter().cloned(), 1);
    let orchestrator = SessionOrchestrator::new(config, collaborators(args, pool)?)?;

    let summary = orchestrator.assign_panel(petition).await?;
    let session_id = summary.session_id.clone();
    info!("Session {} panel {:?}", session_id, summary.panel);

    for juror in failures {
        let state = orchestrator.report_juror_failure(&session_id, juror).await?;
        info!("After failure of {}: {} panel {:?}", juror, state.phase, state.panel);
    }

    for (index, outcomes) in rounds.iter().enumerate() {
        let mut state = orchestrator.get_session_state(&session_id).await?;
        if state.is_terminal() {
            warn!("Session ended before round {}; remaining ballots ignored", index + 1);
            break;
        }

        while let Some(phase) = state.phase.active().filter(|p| *p != Phase::Vote) {
            let entries = state
                .panel
                .iter()
                .map(|j| TranscriptEntry::new(j.clone(), format!("{} statement from {}", phase, j)))
                .collect::<Vec<_>>();
            state = orchestrator.complete_phase(&session_id, phase, entries).await?;
        }
        if state.is_terminal() {
            break;
        }

        for (juror, outcome) in state.panel.iter().zip(outcomes) {
            orchestrator
                .submit_vote(&session_id, juror, *outcome, format!("{} votes {}", juror, outcome))
                .await?;
        }
    }

    let state = orchestrator.get_session_state(&session_id).await?;
    info!("Session {} finished as {}", session_id, state.phase);

    let timeline = orchestrator.reconstruct_audit(&session_id).await?;
    println!("{}", serde_json::to_string_pretty(&timeline)?);

    if let Some(path) = export {
        let bundle = orchestrator.export_audit(&session_id).await?;
        std::fs::write(path, bundle.to_json()?)
            .with_context(|| format!("writing export to {}", path.display()))?;
        info!("Audit export written to {}", path.display());
    }
    Ok(())
}

fn select(args: &Args, petition: &str, jurors: &[String], generation: u64) -> Result<()> {
    let config = load_config(args)?;
    let pool = JurorPool::from_ids(jurors.iter().cloned(), generation);
    let panel = PanelSelector::new(config.eligibility_policy())
        .select(petition, config.selection_seed.as_deref(), &pool)
        .map_err(|e| {
            anyhow::anyhow!(
                "juror pool exhausted: {} eligible, {} required",
                e.available,
                e.required
            )
        })?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "petition_id": petition,
            "pool_generation": generation,
            "seed": config.selection_seed,
            "panel": panel.to_vec(),
        }))?
    );
    Ok(())
}

async fn verify(path: &Path) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading export {}", path.display()))?;
    let export = AuditExport::from_json(&json)?;
    let witness = WitnessChainBuilder::new(Arc::new(export.transcript_store()?));

    let mut all_valid = true;
    let mut reports = Vec::new();
    for session_id in export.session_ids() {
        let timeline =
            AuditReconstructor::from_records(&witness, export.records_for(&session_id)).await;
        all_valid &= timeline.verification.is_valid;
        info!("{}: {}", session_id, timeline.verification.summary());
        reports.push(serde_json::json!({
            "session_id": session_id,
            "report": timeline.verification,
        }));
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    if !all_valid {
        bail!("witness chain verification failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deliberation=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Command::Simulate {
            petition,
            jurors,
            ballots,
            fail,
            export,
        } => simulate(&args, petition, jurors, ballots, fail, export.as_ref()).await,
        Command::Select {
            petition,
            jurors,
            generation,
        } => select(&args, petition, jurors, *generation),
        Command::Verify { path } => verify(path).await,
    }
}
