use anyhow::{bail, ensure};
use clap::Parser;
use core::time::Duration;
use idpool_tonic_core::idpool::{DispatchSettings, LockSettings, QuotaMode, Topics};
use std::path::PathBuf;

/// Runtime configuration for the `idpool-tonic-server` binary.
///
/// Every flag can also be set through the environment variable named next to
/// it; a `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "idpool-tonic-server",
    version,
    about = "A gRPC service dispatching pre-minted IDs under per-requester quotas"
)]
pub struct CliArgs {
    /// Lifetime ceiling on IDs per requester/device pair. Also caps a single
    /// request.
    ///
    /// Environment variable: `DISPATCH_LIMIT_PER_USER`
    #[arg(long, env = "DISPATCH_LIMIT_PER_USER", default_value_t = 100)]
    pub dispatch_limit_per_user: u64,

    /// Number of records pulled from the durable store when the pool cache
    /// runs short.
    ///
    /// Environment variable: `DB_FETCH_LIMIT`
    #[arg(long, env = "DB_FETCH_LIMIT", default_value_t = 500)]
    pub db_fetch_limit: usize,

    /// Topic receiving pool status updates.
    ///
    /// Environment variable: `POOL_STATUS_TOPIC`
    #[arg(long, env = "POOL_STATUS_TOPIC", default_value_t = String::from("update-id-pool-status"))]
    pub pool_status_topic: String,

    /// Topic receiving the dispatch audit log.
    ///
    /// Environment variable: `DISPATCH_LOG_TOPIC`
    #[arg(long, env = "DISPATCH_LOG_TOPIC", default_value_t = String::from("save-id-dispatch-log"))]
    pub dispatch_log_topic: String,

    /// `hard` reserves quota atomically under the ID lock; `soft` checks
    /// before locking and may overshoot under same-pair races.
    ///
    /// Environment variable: `QUOTA_MODE`
    #[arg(long, env = "QUOTA_MODE", value_enum, default_value_t = QuotaMode::Hard)]
    pub quota_mode: QuotaMode,

    /// How long an ID lock is held before it expires on its own.
    ///
    /// Environment variable: `LOCK_LEASE_MS`
    #[arg(long, env = "LOCK_LEASE_MS", default_value_t = 30_000)]
    pub lock_lease_ms: u64,

    /// Extra acquisition attempts when an ID lock is contended.
    ///
    /// Environment variable: `LOCK_RETRY_ATTEMPTS`
    #[arg(long, env = "LOCK_RETRY_ATTEMPTS", default_value_t = 3)]
    pub lock_retry_attempts: u32,

    /// Initial delay between lock attempts, doubled after each retry.
    ///
    /// Environment variable: `LOCK_RETRY_BACKOFF_MS`
    #[arg(long, env = "LOCK_RETRY_BACKOFF_MS", default_value_t = 25)]
    pub lock_retry_backoff_ms: u64,

    /// Deadline for one dispatch attempt, from worker pickup to response.
    ///
    /// Environment variable: `DISPATCH_TIMEOUT_MS`
    #[arg(long, env = "DISPATCH_TIMEOUT_MS", default_value_t = 5_000)]
    pub dispatch_timeout_ms: u64,

    /// Number of dispatch worker tasks.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 16)]
    pub num_workers: usize,

    /// Queue depth in front of each worker.
    ///
    /// Environment variable: `WORK_QUEUE_SIZE`
    #[arg(long, env = "WORK_QUEUE_SIZE", default_value_t = 64)]
    pub work_queue_size: usize,

    /// Capacity of the outgoing event buffer.
    ///
    /// Environment variable: `EVENT_BUFFER_SIZE`
    #[arg(long, env = "EVENT_BUFFER_SIZE", default_value_t = 1024)]
    pub event_buffer_size: usize,

    /// Longest a dispatch waits for room in a full event buffer before
    /// failing.
    ///
    /// Environment variable: `PUBLISH_TIMEOUT_MS`
    #[arg(long, env = "PUBLISH_TIMEOUT_MS", default_value_t = 1_000)]
    pub publish_timeout_ms: u64,

    /// Newline-delimited file of IDs loaded into the store at startup. Blank
    /// lines and lines starting with `#` are skipped.
    ///
    /// Environment variable: `SEED_FILE`
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    /// Seconds to wait for in-flight dispatches during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/idpool.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dispatch: DispatchSettings,
    pub lock: LockSettings,
    pub dispatch_timeout: Duration,
    pub num_workers: usize,
    pub work_queue_size: usize,
    pub event_buffer_size: usize,
    pub publish_timeout: Duration,
    pub seed_file: Option<PathBuf>,
    pub shutdown_timeout: Duration,
    pub server_addr: String,
    pub uds: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        ensure!(
            args.dispatch_limit_per_user > 0,
            "DISPATCH_LIMIT_PER_USER must be greater than 0"
        );
        ensure!(args.db_fetch_limit > 0, "DB_FETCH_LIMIT must be greater than 0");
        ensure!(args.num_workers > 0, "NUM_WORKERS must be greater than 0");
        ensure!(args.work_queue_size > 0, "WORK_QUEUE_SIZE must be greater than 0");
        ensure!(args.event_buffer_size > 0, "EVENT_BUFFER_SIZE must be greater than 0");
        ensure!(args.dispatch_timeout_ms > 0, "DISPATCH_TIMEOUT_MS must be greater than 0");

        let pool_status = args.pool_status_topic.trim().to_string();
        let dispatch_log = args.dispatch_log_topic.trim().to_string();
        if pool_status.is_empty() || dispatch_log.is_empty() {
            bail!("POOL_STATUS_TOPIC and DISPATCH_LOG_TOPIC must not be empty");
        }
        if pool_status == dispatch_log {
            bail!("POOL_STATUS_TOPIC and DISPATCH_LOG_TOPIC must differ (both `{pool_status}`)");
        }

        // Worst-case time spent backing off: backoff * (2^attempts - 1).
        let total_backoff_ms = (0..args.lock_retry_attempts).fold(0_u64, |acc, attempt| {
            acc.saturating_add(
                args.lock_retry_backoff_ms
                    .saturating_mul(1_u64.checked_shl(attempt).unwrap_or(u64::MAX)),
            )
        });
        if args.lock_lease_ms <= total_backoff_ms {
            bail!(
                "LOCK_LEASE_MS ({}) must exceed the total lock retry backoff ({}ms)",
                args.lock_lease_ms,
                total_backoff_ms
            );
        }

        Ok(Self {
            dispatch: DispatchSettings {
                limit: args.dispatch_limit_per_user,
                db_fetch_limit: args.db_fetch_limit,
                quota_mode: args.quota_mode,
                topics: Topics {
                    pool_status,
                    dispatch_log,
                },
            },
            lock: LockSettings {
                lease: Duration::from_millis(args.lock_lease_ms),
                retry_attempts: args.lock_retry_attempts,
                retry_backoff: Duration::from_millis(args.lock_retry_backoff_ms),
            },
            dispatch_timeout: Duration::from_millis(args.dispatch_timeout_ms),
            num_workers: args.num_workers,
            work_queue_size: args.work_queue_size,
            event_buffer_size: args.event_buffer_size,
            publish_timeout: Duration::from_millis(args.publish_timeout_ms),
            seed_file: args.seed_file,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}
