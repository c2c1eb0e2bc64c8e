//! Factory coordinator CLI.
//!
//! Drives the dispatch-and-integrate pipeline for the worker roster in
//! [`factory::core::types::WORKERS`]: mint a run, create isolated worktrees, launch
//! workers, collect their bundles, and integrate the results into one report.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use factory::core::types::{INTEGRATOR, Status, WORKERS};
use factory::exit_codes;
use factory::io::config::{FactoryConfig, load_factory_config, write_default_config};
use factory::io::contracts::{bundle_dir, scaffold_all_bundles, scaffold_worker_bundle, validate_bundle, validate_run};
use factory::io::dispatch::{dispatch_workers, dispatch_result_to_json, wait_for_done_markers};
use factory::io::doctor::run_doctor;
use factory::io::git::Git;
use factory::io::integrator::integrate_run;
use factory::io::ledger::{EventQuery, query_events, replay_runs, verify_ledger_signature};
use factory::io::preflight::run_preflight;
use factory::io::run::{WorktreeManifestEntry, mint_run_id, write_run_manifest};
use factory::io::selftest::run_self_test;
use factory::io::worktree::{create_worktrees, open_worktrees, sync_worktrees, verify_worktrees};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "factory", version, about = "Multi-worker build/validation factory coordinator")]
struct Cli {
    /// Path to factory.config.json. Defaults to tools/codex/factory.config.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file if one does not already exist.
    ConfigInit,
    /// Validate the resolved config and every embedded schema against its fixture.
    ContractsCheck,
    /// Scan lock files for stale owners.
    Doctor {
        #[arg(long)]
        remove_stale: bool,
    },
    /// Mint a new run id, write its manifest, and scaffold empty bundles.
    InitRun {
        #[arg(long)]
        base_ref: Option<String>,
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
    },
    /// Read-only dry run of config validation and the worktree invariant check.
    Preflight,
    /// Worktree lifecycle operations.
    Worktrees {
        #[command(subcommand)]
        action: WorktreeAction,
    },
    /// Scaffold a bundle's default artifacts (idempotent).
    BundleInit {
        run_id: String,
        /// Defaults to every worker plus the integrator.
        worker: Option<String>,
    },
    /// Validate a bundle's shape and schema conformance.
    BundleValidate {
        run_id: String,
        /// Defaults to every worker plus the integrator.
        worker: Option<String>,
    },
    /// Launch worker agent processes and wait for their DONE markers.
    Launch {
        run_id: String,
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
        /// Directory containing <run_id>/<worker>_<run_id>.txt prompt files.
        #[arg(long)]
        prompts_dir: Option<PathBuf>,
        /// Skip launching processes; only poll for markers written by an external launcher.
        #[arg(long)]
        wait_only: bool,
    },
    /// Collect worker bundles, detect overlaps, and produce the final report.
    Integrate {
        run_id: String,
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
    },
    /// End to end: init-run, create worktrees, scaffold bundles, launch, integrate.
    Oneshot {
        #[arg(long)]
        base_ref: Option<String>,
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
        #[arg(long)]
        prompts_dir: Option<PathBuf>,
    },
    /// Print ledger events, optionally filtered.
    Ledger {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Re-read the ledger in strict mode and verify its signature file.
    LedgerReplay,
    /// Round-trip every embedded schema against a minimal fixture and check ledger signing.
    SelfTest,
    /// Print a run's FINAL_REPORT.txt.
    PrintReport { run_id: String },
    /// Alias for print-report; named for parity with the editor-facing workflow.
    OpenReport { run_id: String },
    /// List a run's directory contents.
    OpenRun { run_id: String },
    /// Poll the ledger for a run until it reaches a terminal status or the attempt budget runs out.
    Watch {
        run_id: String,
        #[arg(long, default_value_t = 30)]
        max_polls: u32,
        #[arg(long, default_value_t = 2000)]
        poll_interval_ms: u64,
    },
}

#[derive(Subcommand)]
enum WorktreeAction {
    /// Create (or reuse) the fixed worktree for each worker.
    Create {
        run_id: String,
        #[arg(long)]
        base_ref: Option<String>,
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
    },
    /// Report each worktree's existence and git cleanliness.
    Verify {
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
    },
    /// Fetch and reset each worktree's branch.
    Sync {
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
    },
    /// Launch an editor against each worker's worktree (fire-and-forget).
    Open {
        run_id: String,
        #[arg(long, value_delimiter = ',')]
        workers: Option<Vec<String>>,
        #[arg(long, default_value = "code")]
        editor: String,
    },
}

fn main() {
    factory::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::USAGE_ERROR);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn worker_refs(workers: &Option<Vec<String>>) -> Vec<String> {
    workers.clone().unwrap_or_else(|| WORKERS.iter().map(|w| w.to_string()).collect())
}

fn as_str_refs(workers: &[String]) -> Vec<&str> {
    workers.iter().map(String::as_str).collect()
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    match cli.command {
        Command::ConfigInit => cmd_config_init(config_path.as_deref()),
        Command::ContractsCheck => cmd_contracts_check(config_path.as_deref()),
        Command::Doctor { remove_stale } => cmd_doctor(config_path.as_deref(), remove_stale),
        Command::InitRun { base_ref, workers } => cmd_init_run(config_path.as_deref(), base_ref, workers),
        Command::Preflight => cmd_preflight(config_path.as_deref()),
        Command::Worktrees { action } => cmd_worktrees(config_path.as_deref(), action),
        Command::BundleInit { run_id, worker } => cmd_bundle_init(config_path.as_deref(), &run_id, worker),
        Command::BundleValidate { run_id, worker } => cmd_bundle_validate(config_path.as_deref(), &run_id, worker),
        Command::Launch { run_id, workers, prompts_dir, wait_only } => {
            cmd_launch(config_path.as_deref(), &run_id, workers, prompts_dir, wait_only)
        }
        Command::Integrate { run_id, workers } => cmd_integrate(config_path.as_deref(), &run_id, workers),
        Command::Oneshot { base_ref, workers, prompts_dir } => {
            cmd_oneshot(config_path.as_deref(), base_ref, workers, prompts_dir)
        }
        Command::Ledger { run_id, event_type, limit } => cmd_ledger(config_path.as_deref(), run_id, event_type, limit),
        Command::LedgerReplay => cmd_ledger_replay(config_path.as_deref()),
        Command::SelfTest => cmd_self_test(),
        Command::PrintReport { run_id } | Command::OpenReport { run_id } => {
            cmd_print_report(config_path.as_deref(), &run_id)
        }
        Command::OpenRun { run_id } => cmd_open_run(config_path.as_deref(), &run_id),
        Command::Watch { run_id, max_polls, poll_interval_ms } => {
            cmd_watch(config_path.as_deref(), &run_id, max_polls, poll_interval_ms)
        }
    }
}

fn load_config(config_path: Option<&Path>) -> Result<FactoryConfig> {
    load_factory_config(config_path, None)
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<i32> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(factory::io::config::default_config_path);
    write_default_config(&path)?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_contracts_check(config_path: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let report = run_self_test(&config.runs_dir().join(".contracts_check"))?;
    print_json(&format_self_test(&report))?;
    Ok(report.status.exit_code())
}

#[derive(Serialize)]
struct SelfTestView {
    status: Status,
    schemas: Vec<(String, Status, Vec<String>)>,
    ledger_signature_status: Status,
}

fn format_self_test(report: &factory::io::selftest::SelfTestReport) -> SelfTestView {
    SelfTestView {
        status: report.status,
        schemas: report
            .schema_results
            .iter()
            .map(|r| (r.name.to_string(), r.status, r.errors.clone()))
            .collect(),
        ledger_signature_status: report.ledger_signature_status,
    }
}

fn cmd_doctor(config_path: Option<&Path>, remove_stale: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    let report = run_doctor(&config.runs_dir(), remove_stale)?;
    print_json(&report)?;
    Ok(if report.stale.is_empty() { exit_codes::OK } else { exit_codes::BLOCKED })
}

fn cmd_init_run(config_path: Option<&Path>, base_ref: Option<String>, workers: Option<Vec<String>>) -> Result<i32> {
    let config = load_config(config_path)?;
    let workers = worker_refs(&workers);
    let worker_names = as_str_refs(&workers);
    let base_ref = base_ref.unwrap_or_else(|| config.run.base_ref.clone());

    let repo = Git::new(Path::new(&config.paths.repo_root));
    let run_id = mint_run_id(&repo, &config.runs_dir(), &config.run.kind, &base_ref)?;
    let base_sha = repo.rev_parse(&base_ref)?;

    scaffold_all_bundles(&config.runs_dir(), &run_id, &worker_names)?;

    let worktrees: Vec<WorktreeManifestEntry> = worker_names
        .iter()
        .map(|w| WorktreeManifestEntry {
            worker: w.to_string(),
            path: config.worktrees_dir().join(w),
            branch: format!("{}/{}", config.run.branch_prefix, w),
            status: "PENDING".to_string(),
        })
        .collect();
    let manifest_path = write_run_manifest(
        &config.runs_dir(),
        &run_id,
        &base_ref,
        &base_sha,
        &config,
        &worker_names,
        &worktrees,
    )?;

    println!("run_id={run_id}");
    println!("manifest={}", manifest_path.display());
    Ok(exit_codes::OK)
}

fn cmd_preflight(config_path: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let report = run_preflight(&config.worktrees_dir(), &WORKERS, &config)?;
    print_json(&report.checks)?;
    Ok(report.status.exit_code())
}

fn cmd_worktrees(config_path: Option<&Path>, action: WorktreeAction) -> Result<i32> {
    let config = load_config(config_path)?;
    match action {
        WorktreeAction::Create { run_id, base_ref, workers } => {
            let workers = worker_refs(&workers);
            let worker_names = as_str_refs(&workers);
            let repo = Git::new(Path::new(&config.paths.repo_root));
            let base_ref = base_ref.unwrap_or_else(|| config.run.base_ref.clone());
            let result = create_worktrees(
                &repo,
                &config.runs_dir(),
                &config.worktrees_dir(),
                &run_id,
                "factory-cli",
                &worker_names,
                &base_ref,
            )?;
            print_json(&result)?;
            Ok(result.status.exit_code())
        }
        WorktreeAction::Verify { workers } => {
            let workers = worker_refs(&workers);
            let worker_names = as_str_refs(&workers);
            let steps = verify_worktrees(&config.worktrees_dir(), &worker_names);
            let overall = steps.iter().map(|s| s.status).max().unwrap_or(Status::Pass);
            print_json(&steps)?;
            Ok(overall.exit_code())
        }
        WorktreeAction::Sync { workers } => {
            let workers = worker_refs(&workers);
            let worker_names = as_str_refs(&workers);
            let steps = sync_worktrees(&config.worktrees_dir(), &worker_names);
            let overall = steps.iter().map(|s| s.status).max().unwrap_or(Status::Pass);
            print_json(&steps)?;
            Ok(overall.exit_code())
        }
        WorktreeAction::Open { run_id, workers, editor } => {
            let workers = worker_refs(&workers);
            let worker_names = as_str_refs(&workers);
            let sessions = open_worktrees(&config.runs_dir(), &config.worktrees_dir(), &run_id, &worker_names, &editor)?;
            print_json(&sessions)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_bundle_init(config_path: Option<&Path>, run_id: &str, worker: Option<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    match worker {
        Some(worker) => {
            let result = scaffold_worker_bundle(&config.runs_dir(), run_id, &worker)?;
            print_json(&result.created)?;
        }
        None => {
            let worker_refs_owned = worker_refs(&None);
            let worker_names = as_str_refs(&worker_refs_owned);
            let results = scaffold_all_bundles(&config.runs_dir(), run_id, &worker_names)?;
            print_json(&results.iter().map(|r| (r.worker.clone(), r.created.clone())).collect::<Vec<_>>())?;
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_bundle_validate(config_path: Option<&Path>, run_id: &str, worker: Option<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    match worker {
        Some(worker) => {
            let result = validate_bundle(&config.runs_dir(), run_id, &worker, &config)?;
            print_json(&(result.status, &result.errors))?;
            Ok(result.status.exit_code())
        }
        None => {
            let worker_refs_owned = worker_refs(&None);
            let worker_names = as_str_refs(&worker_refs_owned);
            let result = validate_run(&config.runs_dir(), run_id, &worker_names, &config)?;
            let view: Vec<_> = result.results.iter().map(|r| (r.worker.clone(), r.status, r.errors.clone())).collect();
            print_json(&view)?;
            Ok(result.status.exit_code())
        }
    }
}

fn default_prompts_dir(config: &FactoryConfig) -> PathBuf {
    config.runs_dir().parent().unwrap_or(Path::new(".")).join("prompts")
}

fn cmd_launch(
    config_path: Option<&Path>,
    run_id: &str,
    workers: Option<Vec<String>>,
    prompts_dir: Option<PathBuf>,
    wait_only: bool,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let workers = worker_refs(&workers);
    let worker_names = as_str_refs(&workers);
    let prompts_dir = prompts_dir.unwrap_or_else(|| default_prompts_dir(&config));

    let result = if wait_only {
        let timeout = factory::io::dispatch::compute_hard_timeout_seconds(&config.dispatch, worker_names.len());
        wait_for_done_markers(&config.runs_dir(), run_id, &worker_names, timeout, config.dispatch.poll_interval_ms as u64)
    } else {
        dispatch_workers(&config.runs_dir(), &prompts_dir, &config.worktrees_dir(), run_id, &worker_names, &config.dispatch)?
    };
    print_json(&dispatch_result_to_json(&result))?;
    Ok(result.status.exit_code())
}

fn cmd_integrate(config_path: Option<&Path>, run_id: &str, workers: Option<Vec<String>>) -> Result<i32> {
    let config = load_config(config_path)?;
    let workers = worker_refs(&workers);
    let worker_names = as_str_refs(&workers);
    let result = integrate_run(
        Path::new(&config.paths.repo_root),
        &config.runs_dir(),
        run_id,
        "factory-cli",
        &worker_names,
        &config,
    )?;
    println!("status={}", result.status);
    println!("report={}", result.report_path.display());
    Ok(result.status.exit_code())
}

fn cmd_oneshot(
    config_path: Option<&Path>,
    base_ref: Option<String>,
    workers: Option<Vec<String>>,
    prompts_dir: Option<PathBuf>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let workers = worker_refs(&workers);
    let worker_names = as_str_refs(&workers);
    let base_ref = base_ref.unwrap_or_else(|| config.run.base_ref.clone());
    let prompts_dir = prompts_dir.unwrap_or_else(|| default_prompts_dir(&config));

    let repo = Git::new(Path::new(&config.paths.repo_root));
    let run_id = mint_run_id(&repo, &config.runs_dir(), &config.run.kind, &base_ref)?;
    let base_sha = repo.rev_parse(&base_ref)?;

    let worktree_result = create_worktrees(
        &repo,
        &config.runs_dir(),
        &config.worktrees_dir(),
        &run_id,
        "factory-oneshot",
        &worker_names,
        &base_ref,
    )?;
    if worktree_result.status != Status::Pass {
        print_json(&worktree_result)?;
        bail!("worktree creation blocked for {run_id}");
    }

    scaffold_all_bundles(&config.runs_dir(), &run_id, &worker_names)?;

    let worktrees: Vec<WorktreeManifestEntry> = worktree_result
        .steps
        .iter()
        .map(|s| WorktreeManifestEntry {
            worker: s.worker.clone(),
            path: s.path.clone(),
            branch: format!("{}/{}", config.run.branch_prefix, s.worker),
            status: s.status.to_string(),
        })
        .collect();
    write_run_manifest(&config.runs_dir(), &run_id, &base_ref, &base_sha, &config, &worker_names, &worktrees)?;

    let dispatch_result = dispatch_workers(
        &config.runs_dir(),
        &prompts_dir,
        &config.worktrees_dir(),
        &run_id,
        &worker_names,
        &config.dispatch,
    )?;
    if dispatch_result.status != Status::Pass {
        print_json(&dispatch_result_to_json(&dispatch_result))?;
        bail!("dispatch blocked for {run_id}");
    }

    let integration = integrate_run(
        Path::new(&config.paths.repo_root),
        &config.runs_dir(),
        &run_id,
        "factory-oneshot",
        &worker_names,
        &config,
    )?;

    println!("run_id={run_id}");
    println!("status={}", integration.status);
    println!("report={}", integration.report_path.display());
    Ok(integration.status.exit_code())
}

fn cmd_ledger(config_path: Option<&Path>, run_id: Option<String>, event_type: Option<String>, limit: usize) -> Result<i32> {
    let config = load_config(config_path)?;
    let query = EventQuery {
        run_id: run_id.as_deref(),
        event_type: event_type.as_deref(),
        limit,
        ..Default::default()
    };
    let events = query_events(&config.runs_dir(), &query)?;
    for event in &events {
        println!("{event}");
    }
    Ok(exit_codes::OK)
}

fn cmd_ledger_replay(config_path: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let events = factory::io::ledger::read_events(&config.runs_dir(), true)?;
    let signature = verify_ledger_signature(&config.runs_dir());
    let runs = replay_runs(&config.runs_dir())?;
    println!("events={}", events.len());
    println!("signature_status={}", signature.status);
    print_json(&runs)?;
    Ok(signature.status.exit_code())
}

fn cmd_self_test() -> Result<i32> {
    let scratch = std::env::temp_dir().join(format!("factory-self-test-{}", factory::io::util::current_pid()));
    let report = run_self_test(&scratch)?;
    let _ = std::fs::remove_dir_all(&scratch);
    print_json(&format_self_test(&report))?;
    Ok(report.status.exit_code())
}

fn cmd_print_report(config_path: Option<&Path>, run_id: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let report_path = bundle_dir(&config.runs_dir(), run_id, INTEGRATOR).join("FINAL_REPORT.txt");
    let contents = std::fs::read_to_string(&report_path)
        .with_context(|| format!("read {}", report_path.display()))?;
    print!("{contents}");
    Ok(exit_codes::OK)
}

fn cmd_open_run(config_path: Option<&Path>, run_id: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let run_root = config.runs_dir().join(run_id);
    if !run_root.exists() {
        bail!("no such run: {run_id}");
    }
    let mut entries: Vec<String> = std::fs::read_dir(&run_root)
        .with_context(|| format!("read {}", run_root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    entries.sort();
    println!("{}", run_root.display());
    for entry in entries {
        println!("  {entry}");
    }
    Ok(exit_codes::OK)
}

fn cmd_watch(config_path: Option<&Path>, run_id: &str, max_polls: u32, poll_interval_ms: u64) -> Result<i32> {
    let config = load_config(config_path)?;
    let mut last_seen = 0usize;
    for attempt in 0..max_polls.max(1) {
        let events = query_events(&config.runs_dir(), &EventQuery { run_id: Some(run_id), ..Default::default() })?;
        for event in events.iter().skip(last_seen) {
            println!("{event}");
        }
        last_seen = events.len();

        let terminal = events
            .iter()
            .any(|e| matches!(e.get("event_type").and_then(Value::as_str), Some("RUN_END") | Some("INTEGRATION_RESULT")));
        if terminal {
            return Ok(exit_codes::OK);
        }
        if attempt + 1 < max_polls {
            sleep(Duration::from_millis(poll_interval_ms));
        }
    }
    Ok(exit_codes::PENDING)
}
