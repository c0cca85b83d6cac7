use protocol::WorkType;
use std::env;

/// Config is the per-job configuration every rank passes to `init`.
/// Environment keys supply the deployment-facing knobs; the rest are
/// init parameters with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Count of server ranks (`ADLB_SERVERS`).
    pub servers: u32,
    /// Log total walltime at finalize (`ADLB_PRINT_TIME`).
    pub print_time: bool,
    /// Task types the job will use. CONTROL is added if absent.
    pub types: Vec<WorkType>,
    /// Largest task payload accepted by Put.
    pub max_payload: usize,
    /// Queued-task bound per server; beyond it Put reports OutOfMemory.
    pub max_tasks: usize,
    /// Read-cache entry bound (`TURBINE_CACHE_SIZE`); 0 disables.
    pub cache_entries: usize,
    /// Read-cache byte bound (`TURBINE_CACHE_MAX`).
    pub cache_bytes: u64,
    /// Puts between load-summary broadcasts to peer servers.
    pub summary_interval: usize,
    /// Progress rounds a server will not re-steal a type it just sent away.
    pub steal_cooldown: u64,
    /// Progress rounds an incomplete parallel cohort may hold its task
    /// pinned before it returns to the pool.
    pub cohort_rounds: u32,
    /// Rank-to-node map for node-accurate targeting; None means every
    /// rank is its own node.
    pub nodes: Option<Vec<u32>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            servers: 1,
            print_time: false,
            types: Vec::new(),
            max_payload: 1 << 20,
            max_tasks: 1 << 20,
            cache_entries: 1024,
            cache_bytes: 64 << 20,
            summary_interval: 16,
            steal_cooldown: 64,
            cohort_rounds: 1 << 14,
            nodes: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid {key}={value}")]
pub struct ConfigError {
    key: &'static str,
    value: String,
}

fn parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { key, value }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.as_str() {
            "1" | "true" | "TRUE" | "yes" => Ok(Some(true)),
            "0" | "false" | "FALSE" | "no" => Ok(Some(false)),
            _ => Err(ConfigError { key, value }),
        },
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Defaults overridden by the recognised environment keys.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut cfg = Config::default();
        if let Some(servers) = parse("ADLB_SERVERS")? {
            cfg.servers = servers;
        }
        if let Some(print_time) = parse_bool("ADLB_PRINT_TIME")? {
            cfg.print_time = print_time;
        }
        if let Some(entries) = parse("TURBINE_CACHE_SIZE")? {
            cfg.cache_entries = entries;
        }
        if let Some(bytes) = parse("TURBINE_CACHE_MAX")? {
            cfg.cache_bytes = bytes;
        }
        Ok(cfg)
    }

    pub fn with_types(mut self, types: &[WorkType]) -> Config {
        self.types = types.to_vec();
        self
    }
}

/// Install the global tracing subscriber from the `TURBINE_LOG` family:
/// `TURBINE_LOG` is an EnvFilter directive (or `0` to disable), and
/// `TURBINE_LOG_FILE` redirects output. Call once, before `init`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let directive = match env::var("TURBINE_LOG") {
        Ok(v) if v == "0" || v.eq_ignore_ascii_case("false") => return,
        Ok(v) => v,
        Err(_) => "warn".to_owned(),
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

    if let Ok(path) = env::var("TURBINE_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                let _ = fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .try_init();
            }
            Err(err) => eprintln!("TURBINE_LOG_FILE {path}: {err}"),
        }
        return;
    }
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
