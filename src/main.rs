//! corral CLI — parallel test runner with a declarative `describe`/`test`
//! registration API.
//!
//! One binary, two roles: by default it is the parent process that plans and
//! dispatches a run; with the hidden `--worker-mode` flag (only ever passed
//! by the parent re-execing itself, see [`corral::dispatcher`]) it is a
//! worker that executes one assigned group of tests at a time until told to
//! stop.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use corral::config::{self, RunConfig};
use corral::protocol::{self, ParentMessage, WorkerMessage};
use corral::report::{ConsoleReporter, JUnitReporter, MultiReporter, Reporter};
use corral::runner;
use corral::worker::{self, RecordingSink as _, WorkerEventSink, WorkerLifecycle};

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Parallel test runner with a describe/test registration API", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory to discover test files under.
    #[arg(default_value = ".")]
    test_dir: PathBuf,

    /// Positional substring filters on test file paths.
    name_filters: Vec<String>,

    /// Configuration file path.
    #[arg(long, default_value = "corral.toml")]
    config: PathBuf,

    /// Verbose console output.
    #[arg(short, long)]
    verbose: bool,

    /// Abort with exit 1 if any focus mark (`only`) exists.
    #[arg(long)]
    forbid_only: bool,

    /// Filter by spec full title; `/pattern/flags` is treated as a regex.
    #[arg(short = 'g', long)]
    grep: Option<String>,

    /// Whole-run deadline in milliseconds; 0 = none.
    #[arg(long)]
    global_timeout: Option<u64>,

    /// Worker pool size.
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Generate the plan and print it; do not run anything.
    #[arg(long)]
    list: bool,

    /// Stop after this many failures.
    #[arg(long)]
    max_failures: Option<u32>,

    /// Stop after the first failure (equivalent to `--max-failures 1`).
    #[arg(short = 'x')]
    stop_on_first_failure: bool,

    /// Per-test artifact root.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Suppress worker stdio capture to the console reporter.
    #[arg(long)]
    quiet: bool,

    /// Multiplicity per spec.
    #[arg(long)]
    repeat_each: Option<u32>,

    /// Comma-separated reporter names.
    #[arg(long)]
    reporter: Option<String>,

    /// Max retry count on failure.
    #[arg(long)]
    retries: Option<u32>,

    /// 1-based shard selector, `current/total`.
    #[arg(long)]
    shard: Option<String>,

    /// Snapshot root, relative to the test directory.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// File discovery glob (repeatable).
    #[arg(long = "test-match")]
    test_match: Vec<String>,

    /// File discovery exclusion glob (repeatable).
    #[arg(long = "test-ignore")]
    test_ignore: Vec<String>,

    /// Fixture discovery glob (repeatable), loaded before test files.
    #[arg(long = "fixture-match")]
    fixture_match: Vec<String>,

    /// Fixture discovery exclusion glob (repeatable).
    #[arg(long = "fixture-ignore")]
    fixture_ignore: Vec<String>,

    /// Per-test default timeout in milliseconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Rewrite snapshots on mismatch instead of failing.
    #[arg(short = 'u', long)]
    update_snapshots: bool,

    /// Internal: run as a worker process. Never set this by hand.
    #[arg(long, hide = true)]
    worker_mode: bool,
}

fn apply_overrides(mut config: RunConfig, cli: &Cli) -> RunConfig {
    config.test_dir = cli.test_dir.clone();
    if !cli.name_filters.is_empty() {
        config.name_filters = cli.name_filters.clone();
    }
    config.forbid_only |= cli.forbid_only;
    if cli.grep.is_some() {
        config.grep = cli.grep.clone();
    }
    if let Some(ms) = cli.global_timeout {
        config.global_timeout_ms = ms;
    }
    if let Some(n) = cli.workers {
        config.workers = n;
    }
    config.list_only |= cli.list;
    if let Some(n) = cli.max_failures {
        config.max_failures = Some(n);
    }
    if cli.stop_on_first_failure {
        config.max_failures = Some(1);
    }
    if let Some(dir) = &cli.output {
        config.output_dir = dir.clone();
    }
    config.quiet |= cli.quiet;
    if let Some(n) = cli.repeat_each {
        config.repeat_each = n;
    }
    if let Some(r) = &cli.reporter {
        config.reporters = r.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(n) = cli.retries {
        config.retries = n;
    }
    if let Some(s) = &cli.shard {
        config.shard = parse_shard(s);
    }
    if let Some(dir) = &cli.snapshot_dir {
        config.snapshot_dir = dir.clone();
    }
    if !cli.test_match.is_empty() {
        config.test_match = cli.test_match.clone();
    }
    if !cli.test_ignore.is_empty() {
        config.test_ignore = cli.test_ignore.clone();
    }
    if !cli.fixture_match.is_empty() {
        config.fixture_match = cli.fixture_match.clone();
    }
    if !cli.fixture_ignore.is_empty() {
        config.fixture_ignore = cli.fixture_ignore.clone();
    }
    if let Some(ms) = cli.timeout {
        config.timeout_ms = ms;
    }
    config.update_snapshots |= cli.update_snapshots;
    config
}

fn parse_shard(s: &str) -> Option<(u32, u32)> {
    let (current, total) = s.split_once('/')?;
    Some((current.parse().ok()?, total.parse().ok()?))
}

fn build_reporter(config: &RunConfig, meta: std::collections::HashMap<corral::TestId, corral::report::junit::TestMeta>) -> MultiReporter {
    let mut multi = MultiReporter::new();
    for name in &config.reporters {
        match name.as_str() {
            "console" => multi = multi.with_reporter(ConsoleReporter::new(config.verbose_requested())),
            "junit" => {
                multi = multi.with_reporter(
                    JUnitReporter::new(config.junit_file.clone()).with_test_meta(meta.clone()),
                );
            }
            other => {
                tracing::warn!(reporter = other, "unknown reporter name, ignoring");
            }
        }
    }
    multi
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if cli.worker_mode {
        return run_worker_mode().await;
    }

    let base = if cli.config.exists() {
        config::load_config(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config.display()))?
    } else {
        RunConfig::default()
    };
    let config = apply_overrides(base, &cli);

    let built = runner::build_tree(&config)?;
    for (path, err) in &built.load_failures {
        tracing::warn!(file = %path.display(), error = %err, "file failed to load");
    }

    if config.list_only {
        let plan = corral::generator::generate_plan(&mut { built.tree }, &config)?;
        for test_id in &plan {
            println!("{test_id}");
        }
        return Ok(());
    }

    let mut tree = built.tree;
    let plan = corral::generator::generate_plan(&mut tree, &config)?;
    let meta = runner::build_test_meta(&tree, &plan);
    let reporter = build_reporter(&config, meta);

    let outcome = runner::run(&config, &reporter).await?;

    let code = runner::exit_code(&outcome, &tree);
    std::process::exit(code);
}

/// The worker process's main loop: receive `Init`, rebuild the identical
/// tree locally, then alternate between `Run` assignments and (eventually) a
/// `Stop`, forwarding every event back to the parent over stdout.
async fn run_worker_mode() -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let init = match protocol::read_message::<_, ParentMessage>(&mut stdin).await? {
        Some(ParentMessage::Init { config_snapshot, .. }) => config_snapshot,
        _ => return Ok(()),
    };
    let config: RunConfig = serde_json::from_value(init).context("decoding worker config snapshot")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(async move {
        let mut stdout = BufWriter::new(stdout);
        while let Some(message) = rx.recv().await {
            if protocol::write_message(&mut stdout, &message).await.is_err() {
                break;
            }
        }
        let _ = stdout.shutdown().await;
    });

    let built = match runner::build_tree(&config) {
        Ok(built) => built,
        Err(e) => {
            let _ = tx.send(WorkerMessage::FatalError { message: e.to_string() });
            drop(tx);
            let _ = writer_task.await;
            return Ok(());
        }
    };
    let tree = built.tree;

    let _ = tx.send(WorkerMessage::Ready);

    let mut lifecycle = WorkerLifecycle::new();

    loop {
        match protocol::read_message::<_, ParentMessage>(&mut stdin).await {
            Ok(Some(ParentMessage::Run { group })) => {
                let env_chain = runner::env_chain_for(&group.variant);
                let group_id = group.group_id;
                let mut sink = ProtocolSink { tx: tx.clone() };
                let expected_to_fail = |test_id: corral::TestId| {
                    tree.specs[tree.test(test_id).spec].expected_to_fail
                };
                let skipped = |test_id: corral::TestId| {
                    corral::generator::is_spec_skipped(&tree, tree.test(test_id).spec)
                };
                worker::run_group(
                    &tree,
                    &group,
                    &mut lifecycle,
                    &env_chain,
                    &mut sink,
                    expected_to_fail,
                    skipped,
                )
                .await;
                let _ = tx.send(WorkerMessage::Done { group_id });
            }
            Ok(Some(ParentMessage::Stop)) | Ok(None) => break,
            Ok(Some(ParentMessage::Init { .. })) => {}
            Err(e) => {
                let _ = tx.send(WorkerMessage::FatalError { message: e.to_string() });
                break;
            }
        }
    }

    worker::run_worker_shutdown(&tree, &lifecycle, |tag| corral::env::resolve_chain_for_tag(tag)).await;

    drop(tx);
    let _ = writer_task.await;
    info!("worker shutting down");
    Ok(())
}

/// Bridges the synchronous [`WorkerEventSink`] calls `run_group` makes to
/// the async protocol writer: sends are non-blocking, a dedicated task owns
/// stdout and drains them in order.
struct ProtocolSink {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerEventSink for ProtocolSink {
    fn test_begin(&mut self, test_id: corral::TestId) {
        let _ = self.tx.send(WorkerMessage::TestBegin {
            test_id,
            start_wall_clock: chrono::Utc::now(),
        });
    }

    fn test_end(&mut self, test_id: corral::TestId, result: &corral::protocol::TestEndResult) {
        let _ = self.tx.send(WorkerMessage::TestEnd {
            test_id,
            result: result.clone(),
        });
    }

    fn log(&mut self, test_id: Option<corral::TestId>, stdout: bool, text: String) {
        let message = if stdout {
            WorkerMessage::Stdout { test_id, text }
        } else {
            WorkerMessage::Stderr { test_id, text }
        };
        let _ = self.tx.send(message);
    }
}
