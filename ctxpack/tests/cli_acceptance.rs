use ctxpack_core::{Database, TaskMode};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;

struct CliTestEnv {
    temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("ctxpack/context.db")
    }

    fn write_request(&self, name: &str, body: &serde_json::Value) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, serde_json::to_string(body).expect("serialize request"))
            .expect("failed to write request");
        path
    }
}

fn ctxpack_command(env: &CliTestEnv, args: &[&str]) -> Command {
    let mut command = Command::new(PathBuf::from(assert_cmd::cargo::cargo_bin!("ctxpack")));
    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state);
    command
}

fn run_ctxpack(env: &CliTestEnv, args: &[&str]) -> Output {
    ctxpack_command(env, args)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute ctxpack: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }
    panic!(
        "ctxpack {} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn run_json(env: &CliTestEnv, args: &[&str]) -> serde_json::Value {
    let output = run_ctxpack(env, args);
    assert_success(args, &output);
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "expected JSON from ctxpack {}: {e}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn login_request() -> serde_json::Value {
    serde_json::json!({
        "task": "fix the login crash",
        "current_file": "src/login.js",
        "target_tokens": 2000,
        "min_relevance_score": 0.0,
        "project_files": [
            { "path": "src/login.js", "size": 800, "imports": ["./session"] },
            { "path": "src/session.js", "size": 1200 },
            { "path": "docs/readme.md", "size": 400 }
        ]
    })
}

#[test]
fn rank_then_report_outcome_persists_learning() {
    let env = CliTestEnv::new();
    let request = env.write_request("request.json", &login_request());
    let request_arg = request.to_str().expect("utf-8 path");

    let ranked = run_json(&env, &["rank", "--request", request_arg, "--format", "json"]);
    let session_id = ranked["session_id"].as_i64().expect("session id");
    assert_eq!(ranked["task_mode"], "debug");
    assert_eq!(ranked["included"][0]["path"], "src/login.js");
    assert_eq!(ranked["included"][1]["path"], "src/session.js");
    assert!(ranked["total_tokens"].as_u64().unwrap() <= 2000);

    let session_arg = session_id.to_string();
    let outcome = run_json(
        &env,
        &[
            "outcome",
            &session_arg,
            "--success",
            "--used",
            "src/login.js,src/session.js",
            "--format",
            "json",
        ],
    );
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["files_updated"], 3);
    assert_eq!(outcome["pairs_reinforced"], 1);

    let db_path = env.db_path();
    assert!(db_path.exists(), "snapshot should exist at {}", db_path.display());

    let db = Database::open(&db_path).expect("failed to open snapshot");
    db.migrate().expect("failed to migrate snapshot");
    let session = db
        .get_session(session_id)
        .expect("query session")
        .expect("session persisted");
    assert_eq!(session.outcome_success, Some(true));

    let record = db
        .get_relevance("src/session.js", "fix", TaskMode::Debug)
        .expect("query relevance")
        .expect("relevance learned");
    assert!((record.relevance_score - 0.65).abs() < 1e-9);
}

#[test]
fn duplicate_and_unknown_outcomes_fail() {
    let env = CliTestEnv::new();
    let request = env.write_request("request.json", &login_request());
    let request_arg = request.to_str().expect("utf-8 path");

    let ranked = run_json(&env, &["rank", "--request", request_arg, "--format", "json"]);
    let session_arg = ranked["session_id"].as_i64().unwrap().to_string();

    let first = run_ctxpack(&env, &["outcome", &session_arg, "--failure"]);
    assert_success(&["outcome", &session_arg, "--failure"], &first);

    let second = run_ctxpack(&env, &["outcome", &session_arg, "--failure"]);
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("outcome already recorded"));

    let unknown = run_ctxpack(&env, &["outcome", "4242", "--success"]);
    assert!(!unknown.status.success());
    assert!(String::from_utf8_lossy(&unknown.stderr).contains("session not found: 4242"));
}

#[test]
fn rank_rejects_empty_task() {
    let env = CliTestEnv::new();
    let request = env.write_request(
        "empty.json",
        &serde_json::json!({ "task": "  ", "project_files": [] }),
    );
    let output = run_ctxpack(&env, &["rank", "--request", request.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("task description is required"));
}

#[test]
fn relate_sessions_and_stats_report_state() {
    let env = CliTestEnv::new();

    let relate_args = ["relate", "src/a.rs", "src/b.rs", "--co-changes", "10"];
    let relate = run_ctxpack(&env, &relate_args);
    assert_success(&relate_args, &relate);
    assert!(String::from_utf8_lossy(&relate.stdout).contains("strength 0.70"));

    let empty = run_ctxpack(&env, &["sessions"]);
    assert_success(&["sessions"], &empty);
    assert!(String::from_utf8_lossy(&empty.stdout).contains("No sessions recorded yet."));

    let request = env.write_request("request.json", &login_request());
    let rank_args = ["rank", "--request", request.to_str().unwrap()];
    let rank = run_ctxpack(&env, &rank_args);
    assert_success(&rank_args, &rank);
    let rank_stdout = String::from_utf8_lossy(&rank.stdout);
    assert!(rank_stdout.contains("(debug mode)"));
    assert!(rank_stdout.contains("src/login.js"));

    let sessions = run_json(&env, &["sessions", "--format", "json"]);
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));
    assert_eq!(sessions[0]["task_description"], "fix the login crash");

    let stats = run_json(&env, &["stats", "--format", "json"]);
    assert_eq!(stats["sessions"], 1);
    assert_eq!(stats["relationships"], 1);
    assert_eq!(stats["success_rate"], serde_json::Value::Null);
}

#[cfg(unix)]
#[test]
fn sigterm_shuts_down_through_the_engine() {
    let env = CliTestEnv::new();
    let relate_args = ["relate", "src/a.rs", "src/b.rs", "--co-changes", "3"];
    assert_success(&relate_args, &run_ctxpack(&env, &relate_args));

    // waits on an open stdin until the signal arrives
    let mut child = ctxpack_command(&env, &["rank", "--request", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn ctxpack");
    std::thread::sleep(Duration::from_millis(1000));

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("failed to run kill");
    assert!(status.success());

    // the pending stdin read only returns at EOF, after the signal has won
    std::thread::sleep(Duration::from_millis(500));
    drop(child.stdin.take());

    let output = child.wait_with_output().expect("failed to wait for ctxpack");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("interrupted by SIGTERM"), "stderr:\n{stderr}");

    let db = Database::open(&env.db_path()).expect("failed to open snapshot");
    db.migrate().expect("failed to migrate snapshot");
    assert!(db.get_relationship("src/a.rs", "src/b.rs").unwrap().is_some());
}
