use std::path::PathBuf;

use crate::build_info;
use crate::config::categories::{EVENT_RESULTS, RIDER_INDIVIDUAL};
use crate::scanner::ScanDirection;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    about = "Rate-governed synchronization of rider, club and event data",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run queue workers, the priority scheduler and the status server until signalled.
    Serve(ServeArgs),
    /// Start, resume or inspect resumable range scans.
    #[command(subcommand)]
    Scan(ScanCommand),
    /// Sync specific entities now and exit.
    Sync(SyncArgs),
    /// Manage the roster of tracked entities and their sync priority.
    Track(TrackArgs),
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long = "database-url")]
    pub database_url: Option<String>,
    /// Endpoint category table (JSON). Falls back to `RIDER_SYNC_CATEGORIES`, then built-ins.
    #[arg(long = "categories")]
    pub categories: Option<PathBuf>,
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    #[arg(long = "retry-attempts", default_value_t = 3)]
    pub retry_attempts: u32,
    #[arg(long = "retry-initial-ms", default_value_t = 500)]
    pub retry_initial_ms: u64,
    #[arg(long = "retry-max-ms", default_value_t = 10_000)]
    pub retry_max_ms: u64,
    #[arg(long = "retry-jitter-ms", default_value_t = 250)]
    pub retry_jitter_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub retry: RetryArgs,

    #[arg(long = "workers", default_value_t = 2)]
    pub workers: usize,
    /// Endpoint category queue workers fetch from.
    #[arg(long = "worker-category", default_value = RIDER_INDIVIDUAL)]
    pub worker_category: String,
    /// Endpoint category range scans fetch from.
    #[arg(long = "scan-category", default_value = EVENT_RESULTS)]
    pub scan_category: String,
    #[arg(long = "global-rps", default_value_t = 2)]
    pub global_rps: u32,
    #[arg(long = "status-bind", default_value = "0.0.0.0:3000")]
    pub status_bind: String,

    /// P1 tier interval in minutes; overrides `SCHEDULER_P1_INTERVAL`.
    #[arg(long = "p1-interval")]
    pub p1_interval: Option<i64>,
    #[arg(long = "p2-interval")]
    pub p2_interval: Option<i64>,
    #[arg(long = "p3-interval")]
    pub p3_interval: Option<i64>,
    #[arg(long = "p4-interval")]
    pub p4_interval: Option<i64>,
    /// Do not start the priority scheduler (same as `SCHEDULER_ENABLED=false`).
    #[arg(long, default_value_t = false)]
    pub no_scheduler: bool,
    /// Start with the queue paused; resume with `POST /queue/resume`.
    #[arg(long, default_value_t = false)]
    pub queue_paused: bool,
}

impl ServeArgs {
    pub fn tier_overrides(&self) -> [Option<i64>; 4] {
        [
            self.p1_interval,
            self.p2_interval,
            self.p3_interval,
            self.p4_interval,
        ]
    }
}

#[derive(Subcommand, Debug)]
pub enum ScanCommand {
    /// Begin a new scan and run it in the foreground.
    Start(ScanStartArgs),
    /// Continue a paused or interrupted scan from its checkpoint.
    Resume(ScanResumeArgs),
    /// Print a scan's checkpoint as JSON.
    Show(ScanShowArgs),
    /// Print every stored checkpoint as JSON.
    List(ScanListArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    Forward,
    Backward,
}

impl From<DirectionArg> for ScanDirection {
    fn from(direction: DirectionArg) -> Self {
        match direction {
            DirectionArg::Forward => ScanDirection::Forward,
            DirectionArg::Backward => ScanDirection::Backward,
        }
    }
}

/// Settings for running a scan in this process.
#[derive(Args, Debug, Clone)]
pub struct ScanRunArgs {
    #[arg(long = "category", default_value = EVENT_RESULTS)]
    pub category: String,
    #[arg(long = "save-interval", default_value_t = crate::scanner::DEFAULT_SAVE_INTERVAL)]
    pub save_interval: u32,
    /// Minimum delay between steps, on top of the category budget.
    #[arg(long = "step-delay-ms")]
    pub step_delay_ms: Option<u64>,
    #[arg(long = "global-rps", default_value_t = 2)]
    pub global_rps: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ScanStartArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub run: ScanRunArgs,

    #[arg(long = "scan-id")]
    pub scan_id: String,
    /// Entity whose participation is counted as a match.
    #[arg(long = "target")]
    pub target: i64,
    #[arg(long = "from")]
    pub range_start: i64,
    #[arg(long = "to")]
    pub range_end: i64,
    #[arg(long = "direction", value_enum, default_value_t = DirectionArg::Backward)]
    pub direction: DirectionArg,
    #[arg(long = "expected")]
    pub expected_matches: u32,
    /// Consecutive misses that end the scan. There is deliberately no default.
    #[arg(long = "miss-threshold")]
    pub miss_threshold: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ScanResumeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub run: ScanRunArgs,

    #[arg(long = "scan-id")]
    pub scan_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct ScanShowArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long = "scan-id")]
    pub scan_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct ScanListArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub retry: RetryArgs,

    #[arg(required = true)]
    pub entity_ids: Vec<i64>,
    #[arg(long = "priority", default_value_t = 1)]
    pub priority: u8,
    #[arg(long = "category", default_value = RIDER_INDIVIDUAL)]
    pub category: String,
    #[arg(long = "workers", default_value_t = 1)]
    pub workers: usize,
    #[arg(long = "global-rps", default_value_t = 2)]
    pub global_rps: u32,
}

#[derive(Args, Debug, Clone)]
pub struct TrackArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    pub entity_id: Option<i64>,
    /// Sync tier, 1 (most frequent) to 4.
    #[arg(long = "priority")]
    pub priority: Option<u8>,
    #[arg(long, default_value_t = false)]
    pub remove: bool,
    /// Print the roster instead of changing it.
    #[arg(long, default_value_t = false, conflicts_with_all = ["entity_id", "priority", "remove"])]
    pub list: bool,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, DirectionArg, ScanCommand};
    use crate::build_info;
    use clap::{error::ErrorKind, Parser};

    #[test]
    fn version_short_circuits_other_flags() {
        let err = Cli::try_parse_from(["rider_sync", "--version", "--this-flag-does-not-exist"])
            .expect_err("expected clap to stop parsing after --version");

        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        assert!(
            err.to_string().contains(build_info::VERSION_WITH_COMMIT),
            "version output should include semver+commit hash"
        );
    }

    #[test]
    fn scan_start_requires_miss_threshold() {
        let err = Cli::try_parse_from([
            "rider_sync", "scan", "start", "--scan-id", "s1", "--target", "7", "--from", "100",
            "--to", "1", "--expected", "3",
        ])
        .expect_err("miss threshold has no default");
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn scan_start_parses_range_and_defaults() {
        let cli = Cli::try_parse_from([
            "rider_sync", "scan", "start", "--scan-id", "s1", "--target", "7", "--from", "1",
            "--to", "500", "--direction", "forward", "--expected", "3", "--miss-threshold", "40",
        ])
        .expect("valid scan start");

        let Command::Scan(ScanCommand::Start(args)) = cli.command else {
            panic!("expected scan start");
        };
        assert_eq!(args.direction, DirectionArg::Forward);
        assert_eq!((args.range_start, args.range_end), (1, 500));
        assert_eq!(args.miss_threshold, 40);
        assert_eq!(args.run.save_interval, 25);
        assert_eq!(args.run.category, "event-results");
        assert_eq!(args.common.log_level, "info");
    }

    #[test]
    fn track_list_conflicts_with_changes() {
        let err = Cli::try_parse_from(["rider_sync", "track", "--list", "42"])
            .expect_err("list cannot be combined with an entity");
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn serve_can_start_with_queue_paused() {
        let cli = Cli::try_parse_from(["rider_sync", "serve", "--queue-paused"])
            .expect("valid serve");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.queue_paused);

        let cli = Cli::try_parse_from(["rider_sync", "serve"]).expect("valid serve");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(!args.queue_paused);
    }
}
