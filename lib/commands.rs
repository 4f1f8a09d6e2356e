use crate::{
    cli::{
        Cli, Command, CommonArgs, RetryArgs, ScanCommand, ScanListArgs, ScanResumeArgs,
        ScanRunArgs, ScanShowArgs, ScanStartArgs, ServeArgs, SyncArgs, TrackArgs,
    },
    config::{self, api_token_from_env, scheduler_enabled_from_env, CategoryTable, TierIntervals},
    logging::{format_error_report, init_logging},
    orchestrator::{OrchestratorConfig, SyncOrchestrator},
    queue::{
        worker::{SyncJobProcessor, SyncWorkerConfig, WorkerPool},
        JobState, Priority, SyncJobQueue,
    },
    rate_governor::RateGovernor,
    remote::{global_rate_limiter, HttpFetcher, RetryPolicy},
    scanner::{RangeScanner, ScanError, ScanOutcome, ScanRequest, ScannerConfig},
    server::setup_server_with_addr,
    state::AppState,
    store::{SqliteSyncStore, SyncStore},
};
use dotenv::dotenv;
use serde::Serialize;
use std::env;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_VALIDATION: i32 = 2;
const EXIT_CANCELLED: i32 = 130;
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Dispatches a parsed command line and returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    dotenv().ok();
    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Scan(ScanCommand::Start(args)) => run_scan_start(args).await,
        Command::Scan(ScanCommand::Resume(args)) => run_scan_resume(args).await,
        Command::Scan(ScanCommand::Show(args)) => run_scan_show(args).await,
        Command::Scan(ScanCommand::List(args)) => run_scan_list(args).await,
        Command::Sync(args) => run_sync(args).await,
        Command::Track(args) => run_track(args).await,
    }
}

fn report_failure(event: &'static str, context: &str, err: &(dyn StdError + 'static)) -> i32 {
    let error_report = format_error_report(err);
    error!(
        event,
        error = %err,
        error_report = %error_report,
        "{context}"
    );
    eprintln!("{context}: {err}");
    1
}

fn resolve_database_url(common: &CommonArgs) -> Result<String, String> {
    if let Some(value) = &common.database_url {
        return Ok(value.clone());
    }

    env::var("DATABASE_URL")
        .map_err(|_| "DATABASE_URL is required (env var or --database-url)".to_string())
}

fn validate_global_rps(global_rps: u32) -> Result<NonZeroU32, String> {
    NonZeroU32::new(global_rps).ok_or_else(|| "--global-rps must be > 0".to_string())
}

fn validate_retry_args(retry: &RetryArgs) -> Result<(), String> {
    if retry.retry_attempts == 0 {
        return Err("--retry-attempts must be > 0".to_string());
    }
    if retry.retry_max_ms < retry.retry_initial_ms {
        return Err(format!(
            "--retry-max-ms ({}) must be >= --retry-initial-ms ({})",
            retry.retry_max_ms, retry.retry_initial_ms
        ));
    }
    Ok(())
}

fn retry_policy(retry: &RetryArgs) -> RetryPolicy {
    RetryPolicy {
        max_attempts: retry.retry_attempts,
        initial_backoff: Duration::from_millis(retry.retry_initial_ms),
        max_backoff: Duration::from_millis(retry.retry_max_ms),
        jitter: Duration::from_millis(retry.retry_jitter_ms),
    }
}

pub fn validate_serve_args(args: &ServeArgs) -> Result<(), String> {
    if args.workers == 0 {
        return Err("--workers must be > 0".to_string());
    }
    validate_global_rps(args.global_rps)?;
    validate_retry_args(&args.retry)?;
    args.status_bind.parse::<SocketAddr>().map_err(|err| {
        format!(
            "invalid --status-bind address `{}`: {err}",
            args.status_bind
        )
    })?;
    Ok(())
}

fn validate_scan_run_args(run: &ScanRunArgs) -> Result<(), String> {
    if run.save_interval == 0 {
        return Err("--save-interval must be > 0".to_string());
    }
    validate_global_rps(run.global_rps)?;
    Ok(())
}

pub fn validate_scan_start_args(args: &ScanStartArgs) -> Result<(), String> {
    validate_scan_run_args(&args.run)?;
    scan_request(args).validate().map_err(|err| err.to_string())
}

pub fn validate_sync_args(args: &SyncArgs) -> Result<(), String> {
    Priority::new(args.priority).map_err(|err| format!("--priority: {err}"))?;
    if args.workers == 0 {
        return Err("--workers must be > 0".to_string());
    }
    validate_global_rps(args.global_rps)?;
    validate_retry_args(&args.retry)
}

pub fn validate_track_args(args: &TrackArgs) -> Result<(), String> {
    if args.list {
        return Ok(());
    }
    if args.entity_id.is_none() {
        return Err("an entity id is required unless --list is given".to_string());
    }
    match (args.priority, args.remove) {
        (Some(_), true) => Err("--priority and --remove are mutually exclusive".to_string()),
        (None, false) => Err("one of --priority or --remove is required".to_string()),
        (Some(priority), false) => Priority::new(priority)
            .map(|_| ())
            .map_err(|err| format!("--priority: {err}")),
        (None, true) => Ok(()),
    }
}

fn scan_request(args: &ScanStartArgs) -> ScanRequest {
    ScanRequest {
        scan_id: args.scan_id.clone(),
        target_entity: args.target,
        range_start: args.range_start,
        range_end: args.range_end,
        direction: args.direction.into(),
        expected_matches: args.expected_matches,
        miss_threshold: args.miss_threshold,
    }
}

fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => {
            println!("{rendered}");
            0
        }
        Err(err) => report_failure("json_render_failed", "failed to render output", &err),
    }
}

fn open_store(common: &CommonArgs) -> Result<SqliteSyncStore, i32> {
    let database_url = resolve_database_url(common).map_err(|err| {
        eprintln!("{err}");
        EXIT_VALIDATION
    })?;
    SqliteSyncStore::open(&database_url)
        .map_err(|err| report_failure("store_open_failed", "failed to open database", &err))
}

fn load_categories(common: &CommonArgs) -> Result<CategoryTable, i32> {
    config::load_category_table(common.categories.as_deref()).map_err(|err| {
        report_failure(
            "category_table_invalid",
            "failed to load endpoint categories",
            &err,
        )
    })
}

fn build_fetcher(categories: &CategoryTable, global_rps: NonZeroU32) -> Result<Arc<HttpFetcher>, i32> {
    HttpFetcher::new(
        categories,
        api_token_from_env(),
        global_rate_limiter(global_rps),
    )
    .map(Arc::new)
    .map_err(|err| report_failure("http_client_build_failed", "failed to build HTTP client", &err))
}

/// Resolves on SIGINT or SIGTERM; each SIGHUP reloads tier intervals in between.
async fn serve_until_signalled(
    orchestrator: &SyncOrchestrator,
    tier_overrides: [Option<i64>; 4],
    scheduler_enabled: bool,
) -> Result<(), std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(event = "shutdown_signal", signal = "SIGTERM", "shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!(event = "shutdown_signal", signal = "SIGINT", "shutting down");
                return Ok(());
            }
            _ = sighup.recv() => {
                if !scheduler_enabled {
                    warn!(event = "reload_ignored", "scheduler disabled; ignoring SIGHUP");
                    continue;
                }
                let intervals = TierIntervals::from_env_with_overrides(tier_overrides);
                if let Err(err) = orchestrator.reload_intervals(intervals).await {
                    error!(
                        event = "tier_interval_reload_failed",
                        error = %err,
                        "failed to restart scheduler with reloaded intervals"
                    );
                }
            }
        }
    }
}

/// Runs workers, scheduler and the status server until SIGINT or SIGTERM.
pub async fn run_serve(args: ServeArgs) -> i32 {
    let logging_context = init_logging("serve", &args.common.log_level);
    let run_span = logging_context.root_span();
    let _run_guard = run_span.enter();
    info!(event = "serve_starting", "starting sync service");

    if let Err(err) = validate_serve_args(&args) {
        eprintln!("{err}");
        return EXIT_VALIDATION;
    }
    let Some(global_rps) = NonZeroU32::new(args.global_rps) else {
        return EXIT_VALIDATION;
    };
    let Ok(status_addr) = args.status_bind.parse::<SocketAddr>() else {
        return EXIT_VALIDATION;
    };

    let categories = match load_categories(&args.common) {
        Ok(table) => table,
        Err(code) => return code,
    };
    let store = match open_store(&args.common) {
        Ok(store) => Arc::new(store),
        Err(code) => return code,
    };
    let fetcher = match build_fetcher(&categories, global_rps) {
        Ok(fetcher) => fetcher,
        Err(code) => return code,
    };
    for category in [&args.worker_category, &args.scan_category] {
        if !fetcher.has_endpoint(category) {
            warn!(
                event = "endpoint_missing_url",
                category = %category,
                "category has no url_template; fetches will fail until one is configured"
            );
        }
    }

    let shutdown = CancellationToken::new();
    let config = OrchestratorConfig {
        worker: SyncWorkerConfig {
            worker_count: args.workers,
            category: args.worker_category.clone(),
            retry_policy: retry_policy(&args.retry),
        },
        scanner: ScannerConfig::new(&args.scan_category),
        tier_intervals: TierIntervals::from_env_with_overrides(args.tier_overrides()),
    };
    let orchestrator = match SyncOrchestrator::new(
        &categories,
        fetcher,
        store.clone(),
        store,
        config,
        &shutdown,
    ) {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(err) => {
            return report_failure(
                "orchestrator_build_failed",
                "failed to build sync orchestrator",
                &err,
            )
        }
    };

    let app_state = Arc::new(AppState::new(orchestrator.clone(), shutdown.clone()));
    let server_handle = match setup_server_with_addr(app_state, status_addr).await {
        Ok(handle) => handle,
        Err(err) => {
            return report_failure(
                "status_server_start_failed",
                "failed to start status endpoint",
                &err,
            )
        }
    };

    if args.queue_paused {
        orchestrator.pause_queue();
    }
    orchestrator.start_workers().await;
    let scheduler_enabled = !args.no_scheduler && scheduler_enabled_from_env();
    if scheduler_enabled {
        if let Err(err) = orchestrator.start_scheduler().await {
            warn!(event = "scheduler_start_failed", error = %err, "scheduler did not start");
        }
    } else {
        info!(event = "scheduler_disabled", "priority scheduler disabled");
    }

    let signalled =
        serve_until_signalled(&orchestrator, args.tier_overrides(), scheduler_enabled).await;

    shutdown.cancel();
    orchestrator.shutdown().await;
    if let Err(err) = server_handle.await {
        warn!(event = "status_server_join_failed", error = %err, "status server task failed");
    }

    if let Err(err) = signalled {
        return report_failure(
            "signal_handler_failed",
            "failed to install signal handlers",
            &err,
        );
    }
    info!(event = "serve_stopped", "sync service stopped");
    0
}

fn build_scanner(
    common: &CommonArgs,
    run: &ScanRunArgs,
    shutdown: &CancellationToken,
) -> Result<RangeScanner, i32> {
    let Some(global_rps) = NonZeroU32::new(run.global_rps) else {
        return Err(EXIT_VALIDATION);
    };
    let categories = load_categories(common)?;
    if let Err(err) = categories.require(&run.category) {
        eprintln!("{err}");
        return Err(EXIT_VALIDATION);
    }
    let store = Arc::new(open_store(common)?);
    let fetcher = build_fetcher(&categories, global_rps)?;
    let governor = Arc::new(RateGovernor::new(&categories));
    let config = ScannerConfig {
        category: run.category.clone(),
        save_interval: run.save_interval,
        step_delay: run.step_delay_ms.map(Duration::from_millis),
    };
    RangeScanner::new(governor, fetcher, store, config, shutdown)
        .map_err(|err| report_failure("scanner_build_failed", "failed to build scanner", &err))
}

/// Waits for the scan, cancelling it on Ctrl-C, and prints the final checkpoint.
async fn finish_scan(
    started: Result<crate::scanner::ScanHandle, ScanError>,
    shutdown: CancellationToken,
) -> i32 {
    let handle = match started {
        Ok(handle) => handle,
        Err(err @ (ScanError::InvalidRequest(_)
        | ScanError::NotFound(_)
        | ScanError::AlreadyExists(_)
        | ScanError::AlreadyComplete { .. }
        | ScanError::CategoryMismatch { .. })) => {
            eprintln!("{err}");
            return EXIT_VALIDATION;
        }
        Err(err) => return report_failure("scan_start_failed", "failed to start scan", &err),
    };

    let interrupt = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(event = "scan_interrupt", "Ctrl-C received; cancelling scan");
                shutdown.cancel();
            }
        }
    });
    let result = handle.wait().await;
    interrupt.abort();

    match result {
        Ok(ScanOutcome::Completed { checkpoint, .. }) => print_json(&checkpoint),
        Ok(ScanOutcome::Cancelled { checkpoint }) => {
            print_json(&checkpoint);
            EXIT_CANCELLED
        }
        Err(err) => report_failure("scan_paused", "scan paused", &err),
    }
}

pub async fn run_scan_start(args: ScanStartArgs) -> i32 {
    let logging_context = init_logging("scan", &args.common.log_level);
    let run_span = logging_context.root_span();
    let _run_guard = run_span.enter();

    if let Err(err) = validate_scan_start_args(&args) {
        eprintln!("{err}");
        return EXIT_VALIDATION;
    }
    let shutdown = CancellationToken::new();
    let scanner = match build_scanner(&args.common, &args.run, &shutdown) {
        Ok(scanner) => scanner,
        Err(code) => return code,
    };
    let started = scanner.start_scan(scan_request(&args)).await;
    finish_scan(started, shutdown).await
}

pub async fn run_scan_resume(args: ScanResumeArgs) -> i32 {
    let logging_context = init_logging("scan", &args.common.log_level);
    let run_span = logging_context.root_span();
    let _run_guard = run_span.enter();

    if let Err(err) = validate_scan_run_args(&args.run) {
        eprintln!("{err}");
        return EXIT_VALIDATION;
    }
    let shutdown = CancellationToken::new();
    let scanner = match build_scanner(&args.common, &args.run, &shutdown) {
        Ok(scanner) => scanner,
        Err(code) => return code,
    };
    let started = scanner.resume_scan(&args.scan_id).await;
    finish_scan(started, shutdown).await
}

pub async fn run_scan_show(args: ScanShowArgs) -> i32 {
    init_logging("scan", &args.common.log_level);
    let store = match open_store(&args.common) {
        Ok(store) => store,
        Err(code) => return code,
    };
    match store.load_checkpoint(&args.scan_id).await {
        Ok(Some(checkpoint)) => print_json(&checkpoint),
        Ok(None) => {
            eprintln!("no checkpoint for scan `{}`", args.scan_id);
            1
        }
        Err(err) => report_failure("checkpoint_load_failed", "failed to load checkpoint", &err),
    }
}

pub async fn run_scan_list(args: ScanListArgs) -> i32 {
    init_logging("scan", &args.common.log_level);
    let store = match open_store(&args.common) {
        Ok(store) => store,
        Err(code) => return code,
    };
    match store.list_checkpoints().await {
        Ok(checkpoints) => print_json(&checkpoints),
        Err(err) => report_failure("checkpoint_list_failed", "failed to list checkpoints", &err),
    }
}

/// Enqueues the given entities, drains them with a short-lived worker pool, and prints the jobs.
pub async fn run_sync(args: SyncArgs) -> i32 {
    let logging_context = init_logging("sync", &args.common.log_level);
    let run_span = logging_context.root_span();
    let _run_guard = run_span.enter();

    if let Err(err) = validate_sync_args(&args) {
        eprintln!("{err}");
        return EXIT_VALIDATION;
    }
    let (Ok(priority), Some(global_rps)) =
        (Priority::new(args.priority), NonZeroU32::new(args.global_rps))
    else {
        return EXIT_VALIDATION;
    };

    let categories = match load_categories(&args.common) {
        Ok(table) => table,
        Err(code) => return code,
    };
    if let Err(err) = categories.require(&args.category) {
        eprintln!("{err}");
        return EXIT_VALIDATION;
    }
    let store = match open_store(&args.common) {
        Ok(store) => Arc::new(store),
        Err(code) => return code,
    };
    let fetcher = match build_fetcher(&categories, global_rps) {
        Ok(fetcher) => fetcher,
        Err(code) => return code,
    };

    let governor = Arc::new(RateGovernor::new(&categories));
    let queue = Arc::new(SyncJobQueue::default());
    let worker_config = SyncWorkerConfig {
        worker_count: args.workers,
        category: args.category.clone(),
        retry_policy: retry_policy(&args.retry),
    };
    let processor = Arc::new(SyncJobProcessor::new(governor, fetcher, store, &worker_config));

    let job_ids: Vec<_> = queue
        .enqueue_bulk(args.entity_ids.iter().map(|id| (*id, priority)), "operator")
        .into_iter()
        .map(|(_, outcome)| outcome.job_id())
        .collect();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(args.workers, queue.clone(), processor, &shutdown);
    let interrupted = loop {
        if queue.status().active.is_empty() {
            break false;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break true,
            _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
        }
    };
    pool.shutdown().await;

    let jobs: Vec<_> = job_ids.iter().filter_map(|id| queue.job(*id)).collect();
    let rendered = print_json(&jobs);
    if interrupted {
        return EXIT_CANCELLED;
    }
    if rendered != 0 || jobs.iter().any(|job| job.state != JobState::Done) {
        return 1;
    }
    0
}

pub async fn run_track(args: TrackArgs) -> i32 {
    init_logging("track", &args.common.log_level);
    if let Err(err) = validate_track_args(&args) {
        eprintln!("{err}");
        return EXIT_VALIDATION;
    }
    let store = match open_store(&args.common) {
        Ok(store) => store,
        Err(code) => return code,
    };

    if args.list {
        return match store.tracked_entities().await {
            Ok(entities) => {
                let rows: Vec<_> = entities
                    .into_iter()
                    .map(|(entity_id, priority)| {
                        serde_json::json!({ "entity_id": entity_id, "priority": priority })
                    })
                    .collect();
                print_json(&rows)
            }
            Err(err) => report_failure("roster_list_failed", "failed to list roster", &err),
        };
    }

    let Some(entity_id) = args.entity_id else {
        return EXIT_VALIDATION;
    };
    if args.remove {
        return match store.untrack(entity_id).await {
            Ok(true) => {
                info!(event = "entity_untracked", entity_id, "removed entity from roster");
                0
            }
            Ok(false) => {
                eprintln!("entity {entity_id} is not tracked");
                1
            }
            Err(err) => report_failure("roster_update_failed", "failed to update roster", &err),
        };
    }

    let Some(Ok(priority)) = args.priority.map(Priority::new) else {
        return EXIT_VALIDATION;
    };
    match store.set_priority(entity_id, priority).await {
        Ok(()) => {
            info!(event = "entity_tracked", entity_id, tier = %priority, "tracked entity");
            0
        }
        Err(err) => report_failure("roster_update_failed", "failed to update roster", &err),
    }
}
