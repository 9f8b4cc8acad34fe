use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::logging;
use crate::mempool::ConflictPolicy;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "hashxd.conf";
pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:8332";
pub const DEFAULT_DAEMON_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_MB: usize = 1200;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_REORG_LIMIT: u32 = 200;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub daemon_url: String,
    pub daemon_user: Option<String>,
    pub daemon_password: Option<String>,
    pub daemon_timeout_secs: u64,
    pub cache_mb: usize,
    pub flush_interval_secs: u64,
    pub reorg_limit: u32,
    pub poll_interval_ms: u64,
    pub mempool_conflicts: ConflictPolicy,
    pub force_reorg: Option<u32>,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn next_value<I>(args: &mut I, flag: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid {what} '{value}'"))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut daemon_url = DEFAULT_DAEMON_URL.to_string();
    let mut daemon_url_set = false;
    let mut daemon_user: Option<String> = None;
    let mut daemon_password: Option<String> = None;
    let mut daemon_timeout_secs = DEFAULT_DAEMON_TIMEOUT_SECS;
    let mut cache_mb = DEFAULT_CACHE_MB;
    let mut cache_mb_set = false;
    let mut flush_interval_secs = DEFAULT_FLUSH_INTERVAL_SECS;
    let mut flush_interval_set = false;
    let mut reorg_limit = DEFAULT_REORG_LIMIT;
    let mut reorg_limit_set = false;
    let mut poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
    let mut poll_interval_set = false;
    let mut mempool_conflicts = ConflictPolicy::KeepFirst;
    let mut mempool_conflicts_set = false;
    let mut force_reorg: Option<u32> = None;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut args = raw_args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" | "version" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--daemon-url" => {
                daemon_url = next_value(&mut args, "--daemon-url")?;
                daemon_url_set = true;
            }
            "--daemon-user" => {
                daemon_user = Some(next_value(&mut args, "--daemon-user")?);
            }
            "--daemon-password" => {
                daemon_password = Some(next_value(&mut args, "--daemon-password")?);
            }
            "--daemon-timeout-secs" => {
                let value = next_value(&mut args, "--daemon-timeout-secs")?;
                daemon_timeout_secs = parse_number(&value, "--daemon-timeout-secs")?;
            }
            "--cache-mb" => {
                let value = next_value(&mut args, "--cache-mb")?;
                cache_mb = parse_number(&value, "--cache-mb")?;
                cache_mb_set = true;
            }
            "--flush-interval-secs" => {
                let value = next_value(&mut args, "--flush-interval-secs")?;
                flush_interval_secs = parse_number(&value, "--flush-interval-secs")?;
                flush_interval_set = true;
            }
            "--reorg-limit" => {
                let value = next_value(&mut args, "--reorg-limit")?;
                reorg_limit = parse_number(&value, "--reorg-limit")?;
                reorg_limit_set = true;
            }
            "--poll-interval-ms" => {
                let value = next_value(&mut args, "--poll-interval-ms")?;
                poll_interval_ms = parse_number(&value, "--poll-interval-ms")?;
                poll_interval_set = true;
            }
            "--mempool-conflicts" => {
                let value = next_value(&mut args, "--mempool-conflicts")?;
                mempool_conflicts = ConflictPolicy::parse(&value).ok_or_else(|| {
                    format!("invalid mempool conflict policy '{value}' (expected keep-first|drop-both)")
                })?;
                mempool_conflicts_set = true;
            }
            "--force-reorg" => {
                let value = next_value(&mut args, "--force-reorg")?;
                force_reorg = Some(parse_number(&value, "--force-reorg")?);
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        let last = |key: &str| conf.get(key).and_then(|values| values.last()).cloned();
        let invalid = |key: &str, raw: &str| {
            format!("invalid {key} '{raw}' in {}", conf_file.display())
        };

        if !backend_set {
            if let Some(raw) = last("backend") {
                backend = Backend::parse(&raw).ok_or_else(|| invalid("backend", &raw))?;
            }
        }
        if !daemon_url_set {
            if let Some(raw) = last("daemonurl") {
                daemon_url = raw;
            }
        }
        if daemon_user.is_none() {
            daemon_user = last("rpcuser");
        }
        if daemon_password.is_none() {
            daemon_password = last("rpcpassword");
        }
        if !cache_mb_set {
            if let Some(raw) = last("cachemb") {
                cache_mb = raw.trim().parse().map_err(|_| invalid("cachemb", &raw))?;
            }
        }
        if !flush_interval_set {
            if let Some(raw) = last("flushinterval") {
                flush_interval_secs = raw
                    .trim()
                    .parse()
                    .map_err(|_| invalid("flushinterval", &raw))?;
            }
        }
        if !reorg_limit_set {
            if let Some(raw) = last("reorglimit") {
                reorg_limit = raw.trim().parse().map_err(|_| invalid("reorglimit", &raw))?;
            }
        }
        if !poll_interval_set {
            if let Some(raw) = last("pollinterval") {
                poll_interval_ms = raw
                    .trim()
                    .parse()
                    .map_err(|_| invalid("pollinterval", &raw))?;
            }
        }
        if !mempool_conflicts_set {
            if let Some(raw) = last("mempoolconflicts") {
                mempool_conflicts = ConflictPolicy::parse(&raw)
                    .ok_or_else(|| invalid("mempoolconflicts", &raw))?;
            }
        }
        if !log_level_set {
            if let Some(raw) = last("loglevel") {
                log_level = logging::Level::parse(&raw).ok_or_else(|| invalid("loglevel", &raw))?;
            }
        }
        if !log_format_set {
            if let Some(raw) = last("logformat") {
                log_format =
                    logging::Format::parse(&raw).ok_or_else(|| invalid("logformat", &raw))?;
            }
        }
        if !log_timestamps_set {
            if let Some(raw) = last("logtimestamps") {
                log_timestamps =
                    parse_conf_bool(&raw).ok_or_else(|| invalid("logtimestamps", &raw))?;
            }
        }
    }

    if poll_interval_ms == 0 {
        return Err("--poll-interval-ms must be greater than zero".to_string());
    }

    Ok(CliAction::Run(Box::new(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        daemon_url,
        daemon_user,
        daemon_password,
        daemon_timeout_secs,
        cache_mb,
        flush_interval_secs,
        reorg_limit,
        poll_interval_ms,
        mempool_conflicts,
        force_reorg,
        log_level,
        log_format,
        log_timestamps,
    })))
}

/// Reads `key=value` lines; keys are lowercased and may repeat.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  hashxd [options]",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend to use (fjall|memory) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/hashxd.conf)",
        "  --daemon-url  Upstream node JSON-RPC endpoint (default: http://127.0.0.1:8332)",
        "  --daemon-user  Upstream RPC user (conf: rpcuser)",
        "  --daemon-password  Upstream RPC password (conf: rpcpassword)",
        "  --daemon-timeout-secs  Per-request timeout for upstream RPC (default: 30)",
        "  --cache-mb  Write-back cache ceiling before a flush (default: 1200)",
        "  --flush-interval-secs  Longest time blocks stay unflushed (default: 300)",
        "  --reorg-limit  Deepest reorg handled; undo retention in blocks (default: 200)",
        "  --poll-interval-ms  Upstream tip and mempool polling interval (default: 2000)",
        "  --mempool-conflicts  Double-spend policy (keep-first|drop-both) (default: keep-first)",
        "  --force-reorg  Rewind this many blocks at startup, then resync",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
    ]
    .join("\n")
}
