//! End-to-end coverage for the dispatch-and-integrate pipeline: scaffolds real worker bundles
//! under a temp run directory against a temp git repo, then drives `integrate_run` and the
//! meaningful-execution gate the same way the CLI does.

use std::process::Command;

use factory::core::types::Status;
use factory::io::config::FactoryConfig;
use factory::io::contracts::{bundle_dir, scaffold_worker_bundle};
use factory::io::integrator::integrate_run;
use factory::io::ledger::{EventQuery, query_events, replay_runs};
use factory::io::meaningful_gate::run_meaningful_gate;
use factory::io::util::write_json;
use serde_json::json;
use tempfile::tempdir;

fn init_git_repo(root: &std::path::Path) {
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@example.com"],
        vec!["config", "user.name", "test"],
    ] {
        assert!(Command::new("git").args(&args).current_dir(root).status().unwrap().success());
    }
    std::fs::write(root.join("README.md"), "hi\n").unwrap();
    assert!(Command::new("git").args(["add", "README.md"]).current_dir(root).status().unwrap().success());
    assert!(
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(root)
            .status()
            .unwrap()
            .success()
    );
}

const WORKERS: [&str; 4] = ["A_worker", "B_worker", "C_worker", "D_worker"];

#[test]
fn four_worker_noop_run_passes_and_orders_ledger_events() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let runs_dir = tempdir().unwrap();
    let config = FactoryConfig::default();

    for worker in WORKERS {
        scaffold_worker_bundle(runs_dir.path(), "run-1", worker).unwrap();
    }

    let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &WORKERS, &config).unwrap();
    let report = std::fs::read_to_string(&result.report_path).unwrap();
    assert_eq!(result.status, Status::Pass, "checks failed, see report: {report}");
    assert!(report.contains("- Worker bundles processed: 4"));

    let events = query_events(runs_dir.path(), &EventQuery { run_id: Some("run-1"), ..Default::default() }).unwrap();
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["event_type"].as_str()).collect();
    let integrate_start = kinds.iter().position(|k| *k == "INTEGRATE_START").unwrap();
    let report_written = kinds.iter().position(|k| *k == "REPORT_WRITTEN").unwrap();
    let run_end = kinds.iter().position(|k| *k == "RUN_END").unwrap();
    assert!(integrate_start < report_written, "IntegrateStart must precede ReportWritten");
    assert!(report_written < run_end, "ReportWritten must precede RunEnd");
}

fn declare_change(runs_dir: &std::path::Path, run_id: &str, worker: &str, path: &str, change_type: &str) {
    let target = bundle_dir(runs_dir, run_id, worker);
    write_json(
        &target.join("FILES_CHANGED.json"),
        &json!({
            "schema_version": 1,
            "run_id": run_id,
            "owner": worker,
            "changes": [{
                "path": path,
                "change_type": change_type,
                "owner": worker,
                "reason": "test fixture",
                "sha256": "0".repeat(64),
            }],
            "noop": false,
            "noop_reason": "",
            "noop_ack": "",
        }),
    )
    .unwrap();
    write_json(
        &target.join("SCOPE_LOCK.json"),
        &json!({
            "allowed_globs": ["**"],
            "blocked_globs": [],
            "allow_shared_paths": [],
        }),
    )
    .unwrap();
}

#[test]
fn shared_path_collision_blocks() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let runs_dir = tempdir().unwrap();
    let config = FactoryConfig::default();
    let workers = ["A_worker", "B_worker"];

    for worker in workers {
        scaffold_worker_bundle(runs_dir.path(), "run-1", worker).unwrap();
        declare_change(runs_dir.path(), "run-1", worker, "apps/collision/shared.ts", "modified");
    }

    let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &workers, &config).unwrap();
    assert_eq!(result.status, Status::Blocked);
    let report = std::fs::read_to_string(&result.report_path).unwrap();
    assert!(
        report.contains("overlap: apps/collision/shared.ts (A_worker, B_worker)"),
        "report did not record the overlap: {report}"
    );
}

#[test]
fn scope_violation_blocks() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let runs_dir = tempdir().unwrap();
    let config = FactoryConfig::default();
    let workers = ["A_worker"];

    scaffold_worker_bundle(runs_dir.path(), "run-1", "A_worker").unwrap();
    let target = bundle_dir(runs_dir.path(), "run-1", "A_worker");
    write_json(
        &target.join("FILES_CHANGED.json"),
        &json!({
            "schema_version": 1,
            "run_id": "run-1",
            "owner": "A_worker",
            "changes": [{
                "path": "services/private/secret.py",
                "change_type": "modified",
                "owner": "A_worker",
                "reason": "test fixture",
                "sha256": "0".repeat(64),
            }],
            "noop": false,
            "noop_reason": "",
            "noop_ack": "",
        }),
    )
    .unwrap();
    // default SCOPE_LOCK.json (scaffolded by scaffold_worker_bundle) only allows a_worker/**.

    let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &workers, &config).unwrap();
    assert_eq!(result.status, Status::Blocked);
    let report = std::fs::read_to_string(&result.report_path).unwrap();
    assert!(
        report.contains("scope: A_worker services/private/secret.py"),
        "report did not record the scope violation: {report}"
    );
}

#[test]
fn write_policy_violation_blocks() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let runs_dir = tempdir().unwrap();
    let config = FactoryConfig::default();
    let workers = ["A_worker"];

    scaffold_worker_bundle(runs_dir.path(), "run-1", "A_worker").unwrap();
    factory::io::contracts::scaffold_integrator_bundle(runs_dir.path(), "run-1").unwrap();
    let z_dir = bundle_dir(runs_dir.path(), "run-1", "Z_integrator");

    // Replace MERGE_PLAN.md with a directory: fs::write against a directory path fails with
    // EISDIR independent of file permissions or the running user's privileges. FINAL_REPORT.txt
    // and STATUS.json are rewritten again after the blocker is recorded, so the run still
    // produces a readable, Blocked report even though this one artifact write failed.
    let merge_plan = z_dir.join("MERGE_PLAN.md");
    std::fs::remove_file(&merge_plan).unwrap();
    std::fs::create_dir(&merge_plan).unwrap();

    let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &workers, &config).unwrap();
    assert_eq!(result.status, Status::Blocked);
    let report = std::fs::read_to_string(&result.report_path).unwrap();
    assert!(report.contains("policy:"), "expected a write-policy blocker in report: {report}");
}

#[test]
fn meaningful_gate_phantom_path_fails() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let runs_dir = tempdir().unwrap();
    let integrator_dir = runs_dir.path().join("run-1").join("Z_integrator");
    std::fs::create_dir_all(&integrator_dir).unwrap();
    write_json(
        &integrator_dir.join("FILES_CHANGED.json"),
        &json!({
            "schema_version": 1,
            "run_id": "run-1",
            "owner": "Z_integrator",
            "changes": [{
                "path": "apps/phantom/not_there.txt",
                "change_type": "added",
                "owner": "A_worker",
                "reason": "test fixture",
                "sha256": "0".repeat(64),
            }],
            "noop": false,
            "noop_reason": "",
            "noop_ack": "",
        }),
    )
    .unwrap();
    std::fs::write(
        integrator_dir.join("DIFF.patch"),
        "diff --git a/apps/phantom/not_there.txt b/apps/phantom/not_there.txt\nnew file mode 100644\n",
    )
    .unwrap();

    let report = run_meaningful_gate(repo_dir.path(), runs_dir.path(), "run-1").unwrap();
    assert_eq!(report.verdict.status, Status::Fail);
    assert!(report.payload["fail_modes"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m.as_str() == Some("PHANTOM_PATHS")));
}

#[test]
fn meaningful_gate_is_deterministic_for_real_mutation() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    std::fs::create_dir_all(repo_dir.path().join("apps")).unwrap();
    std::fs::write(repo_dir.path().join("apps/real.txt"), "x").unwrap();
    assert!(
        Command::new("git")
            .args(["add", "apps/real.txt"])
            .current_dir(repo_dir.path())
            .status()
            .unwrap()
            .success()
    );

    let runs_dir = tempdir().unwrap();
    let integrator_dir = runs_dir.path().join("run-1").join("Z_integrator");
    std::fs::create_dir_all(&integrator_dir).unwrap();
    write_json(
        &integrator_dir.join("FILES_CHANGED.json"),
        &json!({
            "schema_version": 1,
            "run_id": "run-1",
            "owner": "Z_integrator",
            "changes": [{
                "path": "apps/real.txt",
                "change_type": "added",
                "owner": "A_worker",
                "reason": "test fixture",
                "sha256": "0".repeat(64),
            }],
            "noop": false,
            "noop_reason": "",
            "noop_ack": "",
        }),
    )
    .unwrap();
    std::fs::write(
        integrator_dir.join("DIFF.patch"),
        "diff --git a/apps/real.txt b/apps/real.txt\nnew file mode 100644\nindex 0000000..g2658d8\n",
    )
    .unwrap();

    let first = run_meaningful_gate(repo_dir.path(), runs_dir.path(), "run-1").unwrap();
    let second = run_meaningful_gate(repo_dir.path(), runs_dir.path(), "run-1").unwrap();
    assert_eq!(first.payload, second.payload);
}

#[test]
fn meaningful_gate_sees_committed_mutation_with_clean_working_tree() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let repo = factory::io::git::Git::new(repo_dir.path());
    let base = repo.rev_parse("HEAD").unwrap();

    std::fs::write(repo_dir.path().join("apps_committed.txt"), "x").unwrap();
    assert!(
        Command::new("git")
            .args(["add", "apps_committed.txt"])
            .current_dir(repo_dir.path())
            .status()
            .unwrap()
            .success()
    );
    assert!(
        Command::new("git")
            .args(["commit", "-m", "add apps_committed.txt"])
            .current_dir(repo_dir.path())
            .status()
            .unwrap()
            .success()
    );
    // working tree is clean now: `git status --porcelain` reports nothing for this commit.

    let runs_dir = tempdir().unwrap();
    let run_dir = runs_dir.path().join("run-1");
    write_json(&run_dir.join("RUN_MANIFEST.json"), &json!({"base_ref": base})).unwrap();
    let integrator_dir = run_dir.join("Z_integrator");
    std::fs::create_dir_all(&integrator_dir).unwrap();
    write_json(
        &integrator_dir.join("FILES_CHANGED.json"),
        &json!({
            "schema_version": 1,
            "run_id": "run-1",
            "owner": "Z_integrator",
            "changes": [{
                "path": "apps_committed.txt",
                "change_type": "added",
                "owner": "A_worker",
                "reason": "test fixture",
                "sha256": "0".repeat(64),
            }],
            "noop": false,
            "noop_reason": "",
            "noop_ack": "",
        }),
    )
    .unwrap();
    std::fs::write(
        integrator_dir.join("DIFF.patch"),
        "diff --git a/apps_committed.txt b/apps_committed.txt\nnew file mode 100644\nindex 0000000..g2658d8\n",
    )
    .unwrap();

    let report = run_meaningful_gate(repo_dir.path(), runs_dir.path(), "run-1").unwrap();
    assert!(
        !report.verdict.fail_modes.contains(&factory::core::meaningful_gate::FailMode::NoGitMutation),
        "committed-but-clean-working-tree mutation should not trip NO_GIT_MUTATION: {:?}",
        report.verdict.fail_modes
    );
    assert!(
        !report.verdict.fail_modes.contains(&factory::core::meaningful_gate::FailMode::DeclarationMismatch),
        "committed mutation visible via base..HEAD should not trip DECLARATION_MISMATCH: {:?}",
        report.verdict.fail_modes
    );
    assert!(report.payload["details"]["git_paths"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p.as_str() == Some("apps_committed.txt")));
}

#[test]
fn internal_error_during_integration_yields_fail_with_status_and_run_end() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let runs_dir = tempdir().unwrap();
    let config = FactoryConfig::default();
    let workers = ["A_worker"];

    scaffold_worker_bundle(runs_dir.path(), "run-1", "A_worker").unwrap();
    let bundle = bundle_dir(runs_dir.path(), "run-1", "A_worker");
    // corrupt FILES_CHANGED.json so collect_worker_inputs hits an unrecoverable parse error.
    std::fs::write(bundle.join("FILES_CHANGED.json"), "{not valid json").unwrap();

    let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &workers, &config).unwrap();
    assert_eq!(result.status, Status::Fail);
    assert!(result.report_path.exists());

    let status_path = bundle_dir(runs_dir.path(), "run-1", "Z_integrator").join("STATUS.json");
    let status: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&status_path).unwrap()).unwrap();
    assert_eq!(status["status"], "FAIL");

    let events = query_events(runs_dir.path(), &EventQuery { run_id: Some("run-1"), ..Default::default() }).unwrap();
    let run_end = events.iter().find(|e| e["event_type"] == "RUN_END").expect("a RUN_END event must be appended");
    assert_eq!(run_end["details"]["status"], "FAIL");
}

#[test]
fn ledger_replay_reconstructs_terminal_state_for_a_run() {
    let repo_dir = tempdir().unwrap();
    init_git_repo(repo_dir.path());
    let runs_dir = tempdir().unwrap();
    let config = FactoryConfig::default();

    scaffold_worker_bundle(runs_dir.path(), "run-1", "A_worker").unwrap();
    let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &["A_worker"], &config).unwrap();
    assert_eq!(result.status, Status::Pass);

    let replays = replay_runs(runs_dir.path()).unwrap();
    let run = replays.iter().find(|r| r.run_id == "run-1").expect("run-1 must be present");
    assert_eq!(run.last_event_type, "RUN_END");
    assert_eq!(run.status.as_deref(), Some("PASS"));
    assert!(run.event_count >= 2);
    assert!(!run.started_at.is_empty());
    assert!(!run.ended_at.is_empty());
    assert!(run.actors.contains(&"Z_integrator".to_string()));
}
