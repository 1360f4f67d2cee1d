#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn qs_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_qs") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/qs");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "quiz-stats-cli", "--bin", "qs"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build qs binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_path(label: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("quiz-contract-{label}-{}.{extension}", Ulid::new()))
}

fn qs_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(qs_binary_path());
    command
        .env_remove("RUST_LOG")
        .env_remove("RUST_BACKTRACE")
        .env_remove("RUST_LIB_BACKTRACE")
        .arg("--db")
        .arg(db_path)
        .arg("--config")
        .arg(temp_path("absent-config", "toml"))
        .arg("--log-level")
        .arg("off");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run qs command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn submit(db_path: &Path, user_key: &str, name: &str, correct: &str, total: &str) -> Output {
    qs_output(
        db_path,
        &[
            "quiz",
            "session",
            "submit",
            "--user-key",
            user_key,
            "--name",
            name,
            "--mode",
            "elements",
            "--correct",
            correct,
            "--total",
            total,
        ],
    )
}

#[test]
fn quiz_help_contract_lists_expected_subcommands() {
    for (args, required) in [
        (vec!["quiz", "--help"], vec!["session", "stats", "view"]),
        (
            vec!["quiz", "session", "--help"],
            vec!["submit", "submit-json", "import", "log"],
        ),
        (vec!["quiz", "stats", "--help"], vec!["list", "show"]),
        (vec!["quiz", "view", "--help"], vec!["rebuild", "check"]),
    ] {
        let output = match Command::new(qs_binary_path()).args(&args).output() {
            Ok(value) => value,
            Err(err) => panic!("failed to run help command: {err}"),
        };

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        for item in required {
            assert!(
                stdout.contains(item),
                "expected help output for {:?} to contain {item}; output={stdout}",
                args
            );
        }
    }
}

#[test]
fn submit_success_envelope_carries_legacy_stats_fields() {
    let db_path = temp_path("submit", "sqlite3");

    let first = submit(&db_path, "k-1", "Ada", "5", "5");
    assert!(first.status.success());
    let second = submit(&db_path, "k-1", "Ada", "3", "5");
    assert!(
        second.status.success(),
        "submit failed: {}",
        String::from_utf8_lossy(&second.stderr)
    );

    let payload = stdout_json(&second);
    assert_eq!(payload["success"], json!(true));
    let stats = &payload["stats"];
    assert_eq!(stats["EXP"], json!(8));
    assert_eq!(stats["LV"], json!(1));
    assert_eq!(stats["tenAve"], json!(0.8));
    assert_eq!(stats["allAve"], json!(0.8));
    assert_eq!(stats["sess"], json!(2));
    assert_eq!(stats["cst"], json!(0));
    assert_eq!(stats["mst"], json!(1));
    assert!(stats["last"].is_string());

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn rejected_submission_prints_error_envelope_and_exits_non_zero() {
    let db_path = temp_path("reject", "sqlite3");

    let output = qs_output(
        &db_path,
        &[
            "quiz",
            "session",
            "submit-json",
            "--payload",
            r#"{"userKey":"k-1","displayName":"Ada","correctCount":9,"totalCount":5}"#,
        ],
    );
    assert!(!output.status.success());
    assert_eq!(
        stdout_json(&output),
        json!({"error": "invalid payload: correctCount 9 exceeds totalCount 5"})
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("session submission rejected"),
        "expected stable error shape, got stderr={stderr}"
    );

    let log = qs_output(&db_path, &["quiz", "session", "log"]);
    assert!(log.status.success());
    assert_eq!(stdout_json(&log), json!([]));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn malformed_submit_json_is_an_invalid_payload() {
    let db_path = temp_path("malformed", "sqlite3");

    let output = qs_output(
        &db_path,
        &["quiz", "session", "submit-json", "--payload", "{not json"],
    );
    assert!(!output.status.success());
    let payload = stdout_json(&output);
    assert!(payload["error"]
        .as_str()
        .is_some_and(|message| message.starts_with("invalid payload:")));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn error_shape_for_missing_aggregate_row_is_stable() {
    let db_path = temp_path("missing-row", "sqlite3");

    let output = qs_output(
        &db_path,
        &[
            "quiz",
            "stats",
            "show",
            "--user-key",
            "k-1",
            "--name",
            "Nobody",
        ],
    );
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("aggregate row not found for k-1:Nobody"),
        "expected stable error shape, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn empty_database_lists_empty_arrays() {
    let db_path = temp_path("empty", "sqlite3");

    let stats = qs_output(&db_path, &["quiz", "stats", "list"]);
    assert!(stats.status.success());
    assert_eq!(stdout_json(&stats), json!([]));

    let check = qs_output(&db_path, &["quiz", "view", "check", "--json"]);
    assert!(check.status.success());
    let payload = stdout_json(&check);
    assert_eq!(payload["contract_version"], json!("view_check.v1"));
    assert_eq!(payload["healthy"], json!(true));
    assert_eq!(payload["tracked_identities"], json!(0));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn import_backfills_out_of_order_sessions_and_reports_failures() {
    let db_path = temp_path("import", "sqlite3");
    let import_path = temp_path("import-payloads", "json");
    let payloads = json!([
        {
            "userKey": "k-1", "displayName": "Ada", "correctCount": 2, "totalCount": 5,
            "timestamp": 1_770_465_660_000_i64
        },
        {
            "userKey": "k-1", "displayName": "Ada", "correctCount": 5, "totalCount": 5,
            "timestamp": 1_770_465_600_000_i64
        },
        {"userKey": 42, "displayName": "Grace", "correctCount": 1, "totalCount": 1},
        {"userKey": "k-1", "displayName": "Ada", "totalCount": 5}
    ]);
    if let Err(err) = std::fs::write(&import_path, payloads.to_string()) {
        panic!("failed to write import file: {err}");
    }

    let output = qs_output(
        &db_path,
        &[
            "quiz",
            "session",
            "import",
            "--file",
            import_path.to_str().unwrap_or(""),
        ],
    );
    assert!(!output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["contract_version"], json!("session_import.v1"));
    assert_eq!(report["submitted"], json!(4));
    assert_eq!(report["succeeded"], json!(3));
    assert_eq!(report["failed"], json!(1));
    assert_eq!(report["failures"][0]["index"], json!(3));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("session import failed for 1 of 4 payloads"));

    let log_output = qs_output(&db_path, &["quiz", "session", "log"]);
    let log = stdout_json(&log_output);
    assert_eq!(log.as_array().map(Vec::len), Some(3));
    assert_eq!(log[1]["seq"], json!(2));
    assert_eq!(log[1]["recordedAt"], json!(1_770_465_600_000_i64));
    assert_eq!(log[2]["userKey"], json!("42"));

    let next = submit(&db_path, "k-1", "Ada", "5", "5");
    assert!(next.status.success());
    let next_payload = stdout_json(&next);
    let stats = &next_payload["stats"];
    assert_eq!(stats["sess"], json!(3));
    assert_eq!(stats["cst"], json!(1));
    assert_eq!(stats["mst"], json!(1));

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&import_path);
}

#[test]
fn view_check_exits_non_zero_on_drift_and_rebuild_heals() {
    let db_path = temp_path("drift", "sqlite3");
    assert!(submit(&db_path, "k-1", "Ada", "4", "5").status.success());

    let tamper = rusqlite::Connection::open(&db_path)
        .and_then(|conn| conn.execute("DELETE FROM aggregate_view", []));
    if let Err(err) = tamper {
        panic!("failed to tamper view: {err}");
    }

    let check = qs_output(&db_path, &["quiz", "view", "check", "--json"]);
    assert!(!check.status.success());
    let payload = stdout_json(&check);
    assert_eq!(payload["healthy"], json!(false));
    assert_eq!(payload["drift"][0]["kind"], json!("missing_row"));

    let rebuild = qs_output(&db_path, &["quiz", "view", "rebuild"]);
    assert!(rebuild.status.success());
    assert_eq!(
        stdout_json(&rebuild),
        json!({"identities": 1, "processed_records": 1})
    );

    let healed = qs_output(&db_path, &["quiz", "view", "check", "--json"]);
    assert!(healed.status.success());

    let _ = std::fs::remove_file(&db_path);
}
