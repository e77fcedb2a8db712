//! Side-panel statistics: Postgres and Docker resource usage.
//!
//! Both collectors shell out (`psql`, `docker`) under a hard timeout. The dashboard
//! polls them through a `StatsPoller`, which keeps at most one fetch in flight and
//! hands the result over through a single slot.

use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

/// Ticks between two stats fetches.
pub const STATS_EVERY_TICKS: u64 = 30;
pub const DATABASE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DOCKER_TIMEOUT: Duration = Duration::from_secs(8);

/// Result of one fetch; the error string is shown in the panel.
pub type Fetched<T> = Result<T, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseStats {
    pub connections: u32,
    pub max_connections: u32,
    pub idle_in_transaction: u32,
    /// Active queries running for more than 30 seconds.
    pub long_running: u32,
    /// Sessions waiting on a lock.
    pub blocking: u32,
    /// Buffer cache hit ratio in `0.0..=1.0`.
    pub cache_hit_ratio: f64,
    pub size: String,
}

impl DatabaseStats {
    /// Connection usage above 90% is worth highlighting.
    pub fn connections_high(&self) -> bool {
        self.max_connections > 0 && self.connections * 10 > self.max_connections * 9
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DockerStats {
    pub mem_used: u64,
    /// Zero when `docker info` does not report it.
    pub mem_limit: u64,
    pub cpu_percent: f64,
    pub disk_used: u64,
}

/// A source of periodic snapshots.
pub trait StatsSource: Send + Sync + 'static {
    type Snapshot: Send + 'static;

    fn fetch(&self) -> impl Future<Output = Fetched<Self::Snapshot>> + Send;
}

pub struct PostgresSource {
    url: String,
}

impl PostgresSource {
    pub fn new(url: &str) -> Self {
        Self {
            url: ensure_ssl_option(url),
        }
    }
}

const DATABASE_QUERY: &str = "SELECT \
    (SELECT count(*) FROM pg_stat_activity), \
    current_setting('max_connections'), \
    (SELECT count(*) FROM pg_stat_activity WHERE state = 'idle in transaction'), \
    (SELECT count(*) FROM pg_stat_activity WHERE state = 'active' AND now() - query_start > interval '30 seconds'), \
    (SELECT count(*) FROM pg_stat_activity WHERE wait_event_type = 'Lock'), \
    (SELECT blks_hit FROM pg_stat_database WHERE datname = current_database()), \
    (SELECT blks_read FROM pg_stat_database WHERE datname = current_database()), \
    pg_database_size(current_database())";

impl StatsSource for PostgresSource {
    type Snapshot = DatabaseStats;

    async fn fetch(&self) -> Fetched<DatabaseStats> {
        let output = run_with_timeout(
            "psql",
            &["-X", "-A", "-t", "-F", "|", "-c", DATABASE_QUERY, &self.url],
            DATABASE_TIMEOUT,
        )
        .await?;
        parse_database_row(&output)
    }
}

/// Local servers usually run without TLS.
fn ensure_ssl_option(url: &str) -> String {
    if url.contains("sslmode=") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&sslmode=disable", url)
    } else {
        format!("{}?sslmode=disable", url)
    }
}

fn parse_database_row(output: &str) -> Fetched<DatabaseStats> {
    let row = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let cols: Vec<&str> = row.trim().split('|').collect();
    if cols.len() < 8 {
        return Err(format!("unexpected psql output: {}", row.trim()));
    }
    let num = |idx: usize| cols[idx].trim().parse::<u64>().unwrap_or(0);
    let hit = num(5);
    let read = num(6);
    Ok(DatabaseStats {
        connections: num(0) as u32,
        max_connections: num(1) as u32,
        idle_in_transaction: num(2) as u32,
        long_running: num(3) as u32,
        blocking: num(4) as u32,
        cache_hit_ratio: if hit + read > 0 {
            hit as f64 / (hit + read) as f64
        } else {
            0.0
        },
        size: format_size(num(7)),
    })
}

pub struct DockerSource;

impl StatsSource for DockerSource {
    type Snapshot = DockerStats;

    async fn fetch(&self) -> Fetched<DockerStats> {
        let deadline = tokio::time::Instant::now() + DOCKER_TIMEOUT;
        let remaining = || deadline.saturating_duration_since(tokio::time::Instant::now());

        let info = run_with_timeout("docker", &["info"], remaining()).await?;
        let mut stats = DockerStats {
            mem_limit: parse_mem_limit(&info),
            ..DockerStats::default()
        };
        // No running containers is not an error.
        if let Ok(usage) = run_with_timeout(
            "docker",
            &["stats", "--no-stream", "--format", "{{.MemUsage}}\t{{.CPUPerc}}"],
            remaining(),
        )
        .await
        {
            let (mem, cpu) = parse_container_usage(&usage);
            stats.mem_used = mem;
            stats.cpu_percent = cpu;
        }
        let df = run_with_timeout("docker", &["system", "df"], remaining()).await?;
        stats.disk_used = parse_disk_usage(&df);
        Ok(stats)
    }
}

async fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Fetched<String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => Err(format!("{} timed out", program)),
        Ok(Err(err)) => Err(format!("{}: {}", program, err)),
        Ok(Ok(output)) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().next().unwrap_or("").trim().to_string();
            if reason.is_empty() {
                Err(format!("{} exited with {}", program, output.status))
            } else {
                Err(format!("{}: {}", program, reason))
            }
        }
        Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()),
    }
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([\d.]+)\s*([KMGT]?i?B)").expect("valid size regex"))
}

fn mem_info_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:Total\s+)?Memory:\s*([\d.]+)\s*([KMGT]?i?B)").expect("valid memory regex")
    })
}

fn parse_mem_limit(info: &str) -> u64 {
    mem_info_pattern()
        .captures(info)
        .map(|caps| parse_size(&caps[1], &caps[2]))
        .unwrap_or(0)
}

/// Sums `used / limit<TAB>cpu%` rows from `docker stats`.
fn parse_container_usage(output: &str) -> (u64, f64) {
    let mut mem = 0;
    let mut cpu = 0.0;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.split('\t');
        if let Some(usage) = parts.next() {
            let used = usage.split('/').next().unwrap_or("");
            if let Some(caps) = size_pattern().captures(used) {
                mem += parse_size(&caps[1], &caps[2]);
            }
        }
        if let Some(percent) = parts.next() {
            cpu += percent.trim().trim_end_matches('%').parse::<f64>().unwrap_or(0.0);
        }
    }
    (mem, cpu)
}

/// Sums the SIZE column of `docker system df`.
fn parse_disk_usage(output: &str) -> u64 {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("TYPE"))
        .filter_map(|line| line.split_whitespace().nth(3).map(str::to_string))
        .filter_map(|field| {
            size_pattern()
                .captures(&field)
                .map(|caps| parse_size(&caps[1], &caps[2]))
        })
        .sum()
}

fn parse_size(number: &str, unit: &str) -> u64 {
    let Ok(value) = number.parse::<f64>() else {
        return 0;
    };
    let unit = unit.trim().to_ascii_uppercase();
    let mult: f64 = match unit.chars().next() {
        Some('K') => 1024.0,
        Some('M') => 1024.0 * 1024.0,
        Some('G') => 1024.0 * 1024.0 * 1024.0,
        Some('T') => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * mult) as u64
}

/// Human-readable size, e.g. `1.5 GB`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 4 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, suffix)
}

/// Runs background fetches and hands results to the dashboard.
pub struct StatsPoller<S: StatsSource> {
    source: Arc<S>,
    slot: Arc<Mutex<Option<Fetched<S::Snapshot>>>>,
    in_flight: Arc<AtomicBool>,
}

impl<S: StatsSource> StatsPoller<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
            slot: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts a fetch unless one is running or an unconsumed result is waiting.
    pub fn kick(&self) -> bool {
        if self.lock_slot().is_some() {
            return false;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }
        let source = Arc::clone(&self.source);
        let slot = Arc::clone(&self.slot);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let result = source.fetch().await;
            if let Err(err) = &result {
                tracing::debug!(error = %err, "stats fetch failed");
            }
            *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(result);
            in_flight.store(false, Ordering::Release);
        });
        true
    }

    /// Takes the waiting result, if any.
    pub fn take(&self) -> Option<Fetched<S::Snapshot>> {
        self.lock_slot().take()
    }

    /// Puts a result in the slot, replacing one not yet taken.
    #[cfg(test)]
    pub fn offer(&self, result: Fetched<S::Snapshot>) {
        *self.lock_slot() = Some(result);
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Fetched<S::Snapshot>>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}
