//! irods-repl CLI - bulk replication, checksum and move runs over an iRODS grid.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use irods_repl::config::validate_for_operation;
use irods_repl::{
    Config, JsonReporter, LineReporter, LogWriter, NullReporter, Operation, Orchestrator,
    ReplError, ReplResult, ReplicationConfig, Reporter, RunStatus,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "irods-repl")]
#[command(about = "Cohort-batched bulk replication, checksum and move for iRODS")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Progress display on stderr: text, json or none
    #[arg(long, default_value = "text", value_parser = ["text", "json", "none"])]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Selection and scheduling overrides shared by every operation.
#[derive(Args, Debug, Clone)]
struct Tuning {
    /// Only process objects created at least this many days ago
    #[arg(long)]
    age: Option<u32>,

    /// Only process objects in this collection and below
    #[arg(long)]
    collection: Option<String>,

    /// Scale the number of concurrent transfer invocations
    #[arg(long)]
    multiplier: Option<f64>,

    /// Maximum transfer threads for a single object
    #[arg(long)]
    max_transfer_threads: Option<usize>,

    /// Stop dispatching new batches at this time (RFC 3339 or "YYYY-MM-DD HH:MM[:SS]" local)
    #[arg(long, value_parser = parse_until)]
    until: Option<DateTime<Utc>>,

    /// Select and plan cohorts without transferring anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate objects that lack a good replica on the destination resource
    Replicate {
        /// Destination root resource
        #[arg(long)]
        dest_resc: Option<String>,

        /// Only replicate objects that have a replica on this root resource
        #[arg(long)]
        src_resc: Option<String>,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Compute missing checksums
    Checksum {
        /// Only checksum replicas on this root resource
        #[arg(long)]
        resc: Option<String>,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Move replicas from one resource to another
    Move {
        /// Root resource to move replicas off
        #[arg(long)]
        src_resc: Option<String>,

        /// Root resource to move replicas to
        #[arg(long)]
        dest_resc: Option<String>,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Test catalog connectivity and transfer tool availability
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ReplError> {
    let cli = Cli::parse();

    let line_reporter = (cli.progress == "text").then(|| Arc::new(LineReporter::new()));
    let log_writer = line_reporter.as_ref().map(|r| r.log_writer());
    setup_logging(&cli.verbosity, &cli.log_format, log_writer).map_err(ReplError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let (operation, tuning) = match cli.command {
        Commands::HealthCheck => return health_check(config, cli.output_json).await,
        Commands::Replicate {
            dest_resc,
            src_resc,
            tuning,
        } => {
            override_opt(&mut config.replication.dest_resc, dest_resc);
            override_opt(&mut config.replication.src_resc, src_resc);
            (Operation::Replicate, tuning)
        }
        Commands::Checksum { resc, tuning } => {
            override_opt(&mut config.replication.src_resc, resc);
            (Operation::Checksum, tuning)
        }
        Commands::Move {
            src_resc,
            dest_resc,
            tuning,
        } => {
            override_opt(&mut config.replication.src_resc, src_resc);
            override_opt(&mut config.replication.dest_resc, dest_resc);
            (Operation::Move, tuning)
        }
    };
    apply_tuning(&mut config.replication, &tuning);

    // Everything that can be rejected without the catalog is rejected here
    config.validate()?;
    validate_for_operation(&config, operation)?;
    if let Some(until) = config.replication.until {
        if until <= Utc::now() {
            return Err(ReplError::DeadlinePassed(until.to_rfc3339()));
        }
    }

    let cancel_token = setup_signal_handler().await;
    let reporter: Arc<dyn Reporter> = match (line_reporter, cli.progress.as_str()) {
        (Some(line), _) => line,
        (None, "json") => Arc::new(JsonReporter),
        (None, _) => Arc::new(NullReporter),
    };

    let orchestrator = Orchestrator::new(config, operation)
        .await?
        .with_reporter(reporter)
        .with_cancel(cancel_token);
    let result = orchestrator.run(tuning.dry_run).await?;

    if cli.output_json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result);
    }

    result.check()
}

async fn health_check(config: Config, output_json: bool) -> Result<(), ReplError> {
    let orchestrator = Orchestrator::new(config, Operation::Replicate).await?;
    let result = orchestrator.health_check().await?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Health Check Results:");
        println!(
            "  Catalog: {} ({}ms)",
            if result.catalog_connected { "OK" } else { "FAILED" },
            result.catalog_latency_ms
        );
        if let Some(ref err) = result.catalog_error {
            println!("    Error: {}", err);
        }
        println!(
            "  Transfer tool ({}): {}",
            result.executor_program,
            if result.executor_found { "OK" } else { "NOT FOUND" }
        );
        println!(
            "\n  Overall: {}",
            if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
        );
    }

    if !result.healthy {
        return Err(ReplError::Config("Health check failed".to_string()));
    }
    Ok(())
}

fn override_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn apply_tuning(settings: &mut ReplicationConfig, tuning: &Tuning) {
    override_opt(&mut settings.age_days, tuning.age);
    override_opt(&mut settings.collection, tuning.collection.clone());
    override_opt(&mut settings.multiplier, tuning.multiplier);
    override_opt(&mut settings.max_threads, tuning.max_transfer_threads);
    override_opt(&mut settings.until, tuning.until);
}

fn print_summary(result: &ReplResult) {
    let heading = match (result.dry_run, result.status) {
        (true, _) => "Dry run completed!",
        (false, RunStatus::Completed) => "Run completed!",
        (false, RunStatus::OutOfTime) => "Run stopped: out of time",
        (false, RunStatus::CircuitOpen) => "Run halted: grid unreachable",
        (false, RunStatus::Cancelled) => "Run cancelled",
    };
    println!("\n{}", heading);
    println!("  Run ID: {}", result.run_id);
    println!("  Operation: {}", result.operation);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Selected: {}", result.candidates);

    if result.dry_run {
        for cohort in result.cohorts.iter().filter(|c| c.objects > 0) {
            println!(
                "  {}: {} objects, {} bytes",
                cohort.label, cohort.objects, cohort.bytes
            );
        }
        return;
    }

    println!("  Completed: {}/{}", result.completed, result.attempted);
    if result.failed_batches > 0 {
        println!("  Failed batches: {}", result.failed_batches);
    }
    for cohort in result.cohorts.iter().filter(|c| c.objects > 0) {
        let state = if cohort.dispatched { "" } else { " (not started)" };
        println!(
            "  {}: {}/{}{}",
            cohort.label, cohort.completed, cohort.objects, state
        );
    }
}

/// Parse `--until` as RFC 3339, or as a local `YYYY-MM-DD HH:MM[:SS]`.
fn parse_until(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| format!("'{}' does not exist in the local time zone", s));
        }
    }
    Err(format!(
        "invalid time '{}': expected RFC 3339 or 'YYYY-MM-DD HH:MM[:SS]'",
        s
    ))
}

fn parse_level(verbosity: &str) -> Level {
    match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. With a status line on stderr, records go
/// through its `LogWriter` so the two never share a terminal line.
fn setup_logging(
    verbosity: &str,
    format: &str,
    status_line: Option<LogWriter>,
) -> Result<(), String> {
    let writer = BoxMakeWriter::new(move || -> Box<dyn Write> {
        match &status_line {
            Some(log) => Box::new(log.clone()),
            None => Box::new(std::io::stderr()),
        }
    });

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(parse_level(verbosity))
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(writer);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (cron/systemd shutdown).
/// In-flight batches are left to finish; no new batch starts.
#[cfg(unix)]
async fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Waiting for running batches to finish...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Waiting for running batches to finish...");
            token.cancel();
        }
    });

    cancel_token
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_until_rfc3339() {
        let dt = parse_until("2030-01-02T03:04:05Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2030-01-02T03:04:05+00:00");

        let dt = parse_until("2030-01-02T03:04:05+02:00").unwrap();
        assert_eq!(dt.hour(), 1);
    }

    #[test]
    fn test_parse_until_local_formats() {
        let with_seconds = parse_until("2030-01-02 06:30:15").unwrap();
        let without = parse_until("2030-01-02 06:30").unwrap();
        assert_eq!((with_seconds - without).num_seconds(), 15);
    }

    #[test]
    fn test_parse_until_rejects_garbage() {
        assert!(parse_until("tomorrow").is_err());
        assert!(parse_until("2030-13-01 00:00").is_err());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_log_records_clear_the_status_line() {
        use irods_repl::ProgressSnapshot;

        let captured = Captured::default();
        let reporter = LineReporter::with_writer(captured.clone());
        let log = reporter.log_writer();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_target(false)
            .with_writer(move || log.clone())
            .finish();

        reporter.update(&ProgressSnapshot {
            cohort: "1t [0B, 32MiB)".into(),
            cohort_completed: 0,
            cohort_total: 2,
            global_completed: 0,
            global_total: 2,
        });
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("Batch 1 failed (exit 1, 2 objects): boom");
        });
        reporter.finish();

        let raw = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let status = "1t [0B, 32MiB): 0/2, all: 0/2";
        // Each physical line is either status redraws or a single log record
        for line in raw.lines() {
            let visible = line.rsplit("\r\x1b[K").next().unwrap_or(line);
            assert!(
                !(visible.contains("all: 0/2") && visible.contains("boom")),
                "fused line: {:?}",
                line
            );
        }
        let record = raw.lines().find(|l| l.contains("boom")).unwrap();
        assert!(record.starts_with("\r\x1b[K"));
        assert!(raw.ends_with(&format!("{}\n", status)));
    }

    #[test]
    fn test_unknown_verbosity_defaults_to_info() {
        assert_eq!(parse_level("loud"), Level::INFO);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
    }

    #[test]
    fn test_override_only_when_set() {
        let mut slot = Some(3);
        override_opt(&mut slot, None);
        assert_eq!(slot, Some(3));
        override_opt(&mut slot, Some(5));
        assert_eq!(slot, Some(5));
    }
}
