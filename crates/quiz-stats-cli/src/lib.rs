//! Stable embedded quiz-stats command surface for host runtimes.
//!
//! Hosts should embed behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_quiz_with_db`] for direct [`QuizCommand`] execution against a DB path.
//! - [`run_quiz`] for execution against an existing [`SqliteQuizStore`].
//!
//! JSON goes to stdout; tracing output goes to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use quiz_stats_core::{
    aggregate_stats, check_view, ingest, rebuild_view, session_log, submit_session,
    AggregateView, Identity, IngestSettings, SubmissionPayload, SubmitResponse, ViewCheck,
};
use quiz_stats_store_sqlite::SqliteQuizStore;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

pub mod config;

pub use config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "qs")]
#[command(about = "Quiz session stats CLI")]
pub struct Cli {
    /// Overrides `storage.db` from the config file.
    #[arg(long)]
    pub db: Option<PathBuf>,

    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Tracing filter, e.g. `info` or `quiz_stats_core=debug`.
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Quiz {
        #[command(subcommand)]
        command: Box<QuizCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum QuizCommand {
    Session {
        #[command(subcommand)]
        command: Box<SessionCommand>,
    },
    Stats {
        #[command(subcommand)]
        command: Box<StatsCommand>,
    },
    View {
        #[command(subcommand)]
        command: Box<ViewCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    Submit(SubmitArgs),
    SubmitJson(SubmitJsonArgs),
    Import(ImportArgs),
    Log,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long)]
    pub user_key: String,
    #[arg(long)]
    pub name: String,
    #[arg(long, default_value = "")]
    pub mode: String,
    #[arg(long)]
    pub correct: u32,
    #[arg(long)]
    pub total: u32,
    #[arg(long)]
    pub public: bool,
    /// Client time in epoch milliseconds.
    #[arg(long)]
    pub timestamp: Option<i64>,
    #[arg(long)]
    pub accuracy: Option<f64>,
    /// Activity day, `YYYY/MM/DD`.
    #[arg(long)]
    pub date: Option<String>,
}

#[derive(Debug, Args)]
pub struct SubmitJsonArgs {
    #[arg(long)]
    pub payload: String,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// JSON array of submission payloads, ingested in file order.
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    List,
    Show(IdentityArgs),
}

#[derive(Debug, Args)]
pub struct IdentityArgs {
    #[arg(long)]
    pub user_key: String,
    #[arg(long)]
    pub name: String,
}

#[derive(Debug, Subcommand)]
pub enum ViewCommand {
    Rebuild,
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImportFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub contract_version: String,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub degraded: usize,
    pub view_unsynced: usize,
    pub failures: Vec<ImportFailure>,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli.config)?;
    init_tracing(cli.log_level.as_deref(), &config.logging.filter);
    tracing::debug!(?cli, "parsed CLI arguments");

    let db_path = cli.db.unwrap_or_else(|| config.storage.db.clone());
    match cli.command {
        Command::Quiz { command } => run_quiz_with_db(&db_path, *command, &config),
    }
}

pub fn run_quiz_with_db(db_path: &Path, command: QuizCommand, config: &AppConfig) -> Result<()> {
    let mut store = SqliteQuizStore::open(db_path)?;
    store.migrate()?;
    run_quiz(command, &mut store, config)
}

pub fn run_quiz(
    command: QuizCommand,
    store: &mut SqliteQuizStore,
    config: &AppConfig,
) -> Result<()> {
    match command {
        QuizCommand::Session { command } => run_session(*command, store, config),
        QuizCommand::Stats { command } => run_stats(*command, store),
        QuizCommand::View { command } => run_view(*command, store),
    }
}

/// `--log-level` wins over `RUST_LOG`, which wins over the config file.
/// Installing twice in one process (embedded hosts, tests) is a no-op.
fn init_tracing(cli_level: Option<&str>, config_filter: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_filter)),
    };

    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn run_session(
    command: SessionCommand,
    store: &mut SqliteQuizStore,
    config: &AppConfig,
) -> Result<()> {
    let settings = config.ingest_settings()?;
    match command {
        SessionCommand::Submit(args) => {
            let payload = payload_from_args(args);
            let response = submit_session(store, &payload, &settings, OffsetDateTime::now_utc());
            print_submit_response(&response)
        }
        SessionCommand::SubmitJson(args) => {
            let response = match SubmissionPayload::from_json_str(&args.payload) {
                Ok(payload) => {
                    submit_session(store, &payload, &settings, OffsetDateTime::now_utc())
                }
                Err(err) => SubmitResponse::Failure {
                    error: err.to_string(),
                },
            };
            print_submit_response(&response)
        }
        SessionCommand::Import(args) => {
            let payloads = read_import_file(&args.file)?;
            let report = import_payloads(store, &payloads, &settings);
            println!("{}", serde_json::to_string_pretty(&report)?);

            if report.failed > 0 {
                return Err(anyhow!(
                    "session import failed for {} of {} payloads",
                    report.failed,
                    report.submitted
                ));
            }
            Ok(())
        }
        SessionCommand::Log => {
            let records = session_log(&*store)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

fn run_stats(command: StatsCommand, store: &SqliteQuizStore) -> Result<()> {
    match command {
        StatsCommand::List => {
            let rows = aggregate_stats(store)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        StatsCommand::Show(args) => {
            let identity = Identity::new(&args.user_key, &args.name);
            let row = store
                .row_for(&identity)?
                .ok_or_else(|| anyhow!("aggregate row not found for {identity}"))?;
            println!("{}", serde_json::to_string_pretty(&row)?);
            Ok(())
        }
    }
}

fn run_view(command: ViewCommand, store: &mut SqliteQuizStore) -> Result<()> {
    match command {
        ViewCommand::Rebuild => {
            let report = rebuild_view(store, OffsetDateTime::now_utc())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        ViewCommand::Check(args) => {
            let check = check_view(&*store)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_view_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "aggregate view check failed: {}",
                    check
                        .drift
                        .iter()
                        .map(|item| format!(
                            "{}:{}:{}:{}",
                            item.kind.as_str(),
                            item.user_key,
                            item.name,
                            item.message
                        ))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
    }
}

fn payload_from_args(args: SubmitArgs) -> SubmissionPayload {
    SubmissionPayload {
        display_name: Some(Value::String(args.name)),
        user_key: Some(Value::String(args.user_key)),
        mode: Some(args.mode),
        correct_count: Some(args.correct),
        total_count: Some(args.total),
        is_public: Some(args.public),
        timestamp: args.timestamp,
        accuracy: args.accuracy,
        date: args.date,
    }
}

fn print_submit_response(response: &SubmitResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    match response {
        SubmitResponse::Success { .. } => Ok(()),
        SubmitResponse::Failure { error } => Err(anyhow!("session submission rejected: {error}")),
    }
}

fn read_import_file(path: &Path) -> Result<Vec<Value>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read import file {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("import file must be valid JSON: {}", path.display()))?;

    match parsed {
        Value::Array(items) => Ok(items),
        _ => Err(anyhow!(
            "import file must contain a JSON array of payloads: {}",
            path.display()
        )),
    }
}

/// Ingests each payload in order; one bad payload does not stop the rest.
fn import_payloads(
    store: &mut SqliteQuizStore,
    payloads: &[Value],
    settings: &IngestSettings,
) -> ImportReport {
    let mut report = ImportReport {
        contract_version: "session_import.v1".to_string(),
        submitted: payloads.len(),
        succeeded: 0,
        failed: 0,
        degraded: 0,
        view_unsynced: 0,
        failures: Vec::new(),
    };

    for (index, raw) in payloads.iter().enumerate() {
        let outcome = SubmissionPayload::from_json(raw)
            .and_then(|payload| ingest(store, &payload, settings, OffsetDateTime::now_utc()));
        match outcome {
            Ok(receipt) => {
                report.succeeded += 1;
                if receipt.degraded {
                    report.degraded += 1;
                }
                if !receipt.view_synced {
                    report.view_unsynced += 1;
                }
            }
            Err(err) => {
                tracing::warn!(index, error = %err, "import payload rejected");
                report.failed += 1;
                report.failures.push(ImportFailure {
                    index,
                    error: err.to_string(),
                });
            }
        }
    }

    tracing::info!(
        submitted = report.submitted,
        succeeded = report.succeeded,
        failed = report.failed,
        "session import finished"
    );
    report
}

fn print_view_check(check: &ViewCheck) {
    println!("contract={}", check.contract_version);
    println!(
        "tracked_identities={} view_rows={} drift={}",
        check.tracked_identities,
        check.view_rows,
        check.drift.len()
    );
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.drift.is_empty() {
        println!("{:<24} {:<24} {:<18} message", "user_key", "name", "kind");
        println!("{}", "-".repeat(100));
        for item in &check.drift {
            println!(
                "{:<24} {:<24} {:<18} {}",
                item.user_key,
                item.name,
                item.kind.as_str(),
                item.message
            );
        }
        println!("hint=run `qs quiz view rebuild` to recompute the view from the session log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_path(label: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("quiz-cli-{label}-{}.{extension}", Ulid::new()))
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn submit_args(correct: u32, total: u32) -> SubmitArgs {
        SubmitArgs {
            user_key: "k-1".to_string(),
            name: "Ada".to_string(),
            mode: "elements".to_string(),
            correct,
            total,
            public: false,
            timestamp: Some(1_770_465_600_000),
            accuracy: None,
            date: None,
        }
    }

    #[test]
    fn payload_from_args_carries_every_field() {
        let mut args = submit_args(4, 5);
        args.public = true;
        args.accuracy = Some(0.8);
        args.date = Some("2026/02/07".to_string());

        let payload = payload_from_args(args);
        assert_eq!(payload.user_key, Some(json!("k-1")));
        assert_eq!(payload.display_name, Some(json!("Ada")));
        assert_eq!(payload.correct_count, Some(4));
        assert_eq!(payload.total_count, Some(5));
        assert_eq!(payload.is_public, Some(true));
        assert_eq!(payload.accuracy, Some(0.8));
        assert_eq!(payload.date.as_deref(), Some("2026/02/07"));
    }

    #[test]
    fn import_file_must_be_a_json_array() {
        let path = temp_path("import-object", "json");
        must(fs::write(&path, r#"{"correctCount": 1}"#).map_err(Into::into));
        assert!(read_import_file(&path).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn import_counts_failures_without_stopping() {
        let mut store = must(SqliteQuizStore::open(Path::new(":memory:")));
        must(store.migrate());
        let payloads = vec![
            json!({"userKey": "k-1", "displayName": "Ada", "correctCount": 5, "totalCount": 5}),
            json!({"userKey": "k-1", "displayName": "Ada", "correctCount": 6, "totalCount": 5}),
            json!({"userKey": "k-1", "displayName": "Ada", "correctCount": 2, "totalCount": 5}),
        ];

        let report = import_payloads(&mut store, &payloads, &IngestSettings::default());
        assert_eq!(report.submitted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].index, 1);
        assert!(report.failures[0].error.starts_with("invalid payload"));

        let rows = must(aggregate_stats(&store).map_err(Into::into));
        assert_eq!(rows[0].exp, 7);
        assert_eq!(rows[0].sess, 2);
    }

    #[test]
    fn stable_embed_api_host_path_stays_operational() {
        let db_path = temp_path("embed-host", "sqlite3");
        let config = AppConfig::default();

        must(run_quiz_with_db(
            &db_path,
            QuizCommand::Session {
                command: Box::new(SessionCommand::Submit(submit_args(5, 5))),
            },
            &config,
        ));

        let mut store = must(SqliteQuizStore::open(&db_path));
        must(store.migrate());
        must(run_quiz(
            QuizCommand::View {
                command: Box::new(ViewCommand::Rebuild),
            },
            &mut store,
            &config,
        ));
        must(run_quiz(
            QuizCommand::View {
                command: Box::new(ViewCommand::Check(CheckArgs { json: true })),
            },
            &mut store,
            &config,
        ));

        let db_path_str = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        let missing_config = temp_path("embed-config", "toml");
        let missing_config_str = missing_config.to_string_lossy().to_string();
        must(execute_cli(&[
            "qs",
            "--db",
            &db_path_str,
            "--config",
            &missing_config_str,
            "quiz",
            "stats",
            "show",
            "--user-key",
            "k-1",
            "--name",
            "Ada",
        ]));

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn cli_end_to_end_submit_tamper_check_and_rebuild() {
        let db_path = temp_path("e2e", "sqlite3");
        let db_path_str = db_path.to_string_lossy().to_string();
        let config_path = temp_path("e2e-config", "toml");
        let config_path_str = config_path.to_string_lossy().to_string();
        must(fs::write(&config_path, "[display]\nutc_offset_minutes = 540\n").map_err(Into::into));

        for (correct, total) in [("5", "5"), ("3", "5"), ("5", "5")] {
            must(execute_cli(&[
                "qs",
                "--db",
                &db_path_str,
                "--config",
                &config_path_str,
                "quiz",
                "session",
                "submit",
                "--user-key",
                "k-1",
                "--name",
                "Ada",
                "--correct",
                correct,
                "--total",
                total,
            ]));
        }

        let rejected = execute_cli(&[
            "qs",
            "--db",
            &db_path_str,
            "--config",
            &config_path_str,
            "quiz",
            "session",
            "submit-json",
            "--payload",
            r#"{"userKey":"k-1","displayName":"Ada","correctCount":9,"totalCount":5}"#,
        ]);
        assert!(rejected.is_err());

        let store = must(SqliteQuizStore::open(&db_path));
        let records = must(store.list_sessions());
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].snapshot.exp, 13);
        assert_eq!(records[2].snapshot.cst, 1);
        assert_eq!(records[2].snapshot.mst, 1);
        drop(store);

        let tamper = rusqlite::Connection::open(&db_path)
            .and_then(|conn| conn.execute("UPDATE aggregate_view SET sess = 1", []));
        if let Err(err) = tamper {
            panic!("failed to tamper view: {err}");
        }

        let check_before_rebuild = execute_cli(&[
            "qs", "--db", &db_path_str, "--config", &config_path_str, "quiz", "view", "check",
        ]);
        assert!(check_before_rebuild.is_err());

        must(execute_cli(&[
            "qs", "--db", &db_path_str, "--config", &config_path_str, "quiz", "view", "rebuild",
        ]));
        must(execute_cli(&[
            "qs", "--db", &db_path_str, "--config", &config_path_str, "quiz", "view", "check",
            "--json",
        ]));

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&config_path);
    }
}
