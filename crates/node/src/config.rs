//! Command line and `cfsync.conf` handling for `cfsyncd`.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cfsync_chainstate::header_oracle::{DEFAULT_MAX_ORPHANS, DEFAULT_ORPHAN_RESOLVE_LIMIT};
use cfsync_chainstate::{FilterConfig, OracleConfig, TieBreak};
use cfsync_consensus::constants::{MAX_CFHEADERS_PER_MESSAGE, MAX_GETCFILTERS_SIZE};
use cfsync_consensus::{chain_params, Chain, ChainParams, FilterType};
use cfsync_log::{Format, Level, LogConfig};

use crate::network::NetworkConfig;
use crate::peer_manager::{PeerManagerConfig, DEFAULT_MIN_PEERS};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "cfsync.conf";
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;

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

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub chain: Chain,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_file: PathBuf,
    pub seednode: Option<SocketAddr>,
    pub min_peers: usize,
    pub filter_types: Vec<FilterType>,
    pub max_orphans: usize,
    pub orphan_resolve_limit: usize,
    pub cfheaders_window: i32,
    pub cfilters_window: i32,
    pub tie_break: TieBreak,
    pub log_level: Level,
    pub log_format: Format,
    pub log_timestamps: bool,
    pub status_interval_secs: u64,
}

impl Config {
    pub fn params(&self) -> ChainParams {
        chain_params(self.chain)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: self.log_timestamps,
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        let mut config = NetworkConfig::new(&self.params());
        config.oracle = OracleConfig {
            max_orphans: self.max_orphans,
            orphan_resolve_limit: self.orphan_resolve_limit,
            tie_break: self.tie_break,
        };
        let mut filters = FilterConfig::new(self.filter_types.clone());
        filters.cfheaders_window = self.cfheaders_window;
        filters.cfilters_window = self.cfilters_window;
        config.filters = filters;
        config.peers = PeerManagerConfig {
            min_peers: self.min_peers,
            default_peer: self.seednode,
            ..PeerManagerConfig::default()
        };
        config
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut chain = Chain::Bitcoin;
    let mut chain_set = false;
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut seednode_raw: Option<String> = None;
    let mut min_peers = DEFAULT_MIN_PEERS;
    let mut min_peers_set = false;
    let mut filter_types: Vec<FilterType> = Vec::new();
    let mut max_orphans = DEFAULT_MAX_ORPHANS;
    let mut max_orphans_set = false;
    let mut orphan_resolve_limit = DEFAULT_ORPHAN_RESOLVE_LIMIT;
    let mut orphan_resolve_limit_set = false;
    let mut cfheaders_window = MAX_CFHEADERS_PER_MESSAGE as i32;
    let mut cfheaders_window_set = false;
    let mut cfilters_window = MAX_GETCFILTERS_SIZE as i32;
    let mut cfilters_window_set = false;
    let mut tie_break = TieBreak::FirstSeen;
    let mut tie_break_set = false;
    let mut log_level = Level::Info;
    let mut log_level_set = false;
    let mut log_format = Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;
    let mut status_interval_set = false;
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        let mut value_for = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
        };
        match arg.as_str() {
            "--chain" => {
                let value = value_for("--chain")?;
                chain = Chain::parse(&value)
                    .ok_or_else(|| format!("invalid chain '{value}'\n{}", usage()))?;
                chain_set = true;
            }
            "--backend" => {
                let value = value_for("--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--data-dir" => data_dir = Some(PathBuf::from(value_for("--data-dir")?)),
            "--conf" => conf_path = Some(PathBuf::from(value_for("--conf")?)),
            "--seednode" => seednode_raw = Some(value_for("--seednode")?),
            "--min-peers" => {
                let value = value_for("--min-peers")?;
                min_peers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid min peers '{value}'\n{}", usage()))?;
                min_peers_set = true;
            }
            "--filter-type" => {
                let value = value_for("--filter-type")?;
                let filter_type = FilterType::parse(&value)
                    .ok_or_else(|| format!("invalid filter type '{value}'\n{}", usage()))?;
                if !filter_types.contains(&filter_type) {
                    filter_types.push(filter_type);
                }
            }
            "--max-orphans" => {
                let value = value_for("--max-orphans")?;
                max_orphans = parse_positive(&value)
                    .ok_or_else(|| format!("invalid max orphans '{value}'\n{}", usage()))?;
                max_orphans_set = true;
            }
            "--orphan-resolve-limit" => {
                let value = value_for("--orphan-resolve-limit")?;
                orphan_resolve_limit = parse_positive(&value).ok_or_else(|| {
                    format!("invalid orphan resolve limit '{value}'\n{}", usage())
                })?;
                orphan_resolve_limit_set = true;
            }
            "--cfheaders-window" => {
                let value = value_for("--cfheaders-window")?;
                cfheaders_window = parse_window(&value, MAX_CFHEADERS_PER_MESSAGE)
                    .ok_or_else(|| format!("invalid cfheaders window '{value}'\n{}", usage()))?;
                cfheaders_window_set = true;
            }
            "--cfilters-window" => {
                let value = value_for("--cfilters-window")?;
                cfilters_window = parse_window(&value, MAX_GETCFILTERS_SIZE)
                    .ok_or_else(|| format!("invalid cfilters window '{value}'\n{}", usage()))?;
                cfilters_window_set = true;
            }
            "--tie-break" => {
                let value = value_for("--tie-break")?;
                tie_break = TieBreak::parse(&value)
                    .ok_or_else(|| format!("invalid tie break '{value}'\n{}", usage()))?;
                tie_break_set = true;
            }
            "--log-level" => {
                let value = value_for("--log-level")?;
                log_level = Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = value_for("--log-format")?;
                log_format = Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                let value = value_for("--log-timestamps")?;
                log_timestamps = parse_conf_bool(&value)
                    .ok_or_else(|| format!("invalid log timestamps '{value}'\n{}", usage()))?;
                log_timestamps_set = true;
            }
            "--status-interval" => {
                let value = value_for("--status-interval")?;
                status_interval_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid status interval '{value}'\n{}", usage()))?;
                status_interval_set = true;
            }
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        let invalid = |key: &str, raw: &str| format!("invalid {key} '{raw}' in {}", conf_file.display());
        if !chain_set {
            if let Some(raw) = conf_last(&conf, "chain") {
                chain = Chain::parse(raw).ok_or_else(|| invalid("chain", raw))?;
            }
        }
        if !backend_set {
            if let Some(raw) = conf_last(&conf, "backend") {
                backend = Backend::parse(raw).ok_or_else(|| invalid("backend", raw))?;
            }
        }
        if seednode_raw.is_none() {
            seednode_raw = conf_last(&conf, "seednode").cloned();
        }
        if !min_peers_set {
            if let Some(raw) = conf_last(&conf, "min-peers") {
                min_peers = raw.parse().map_err(|_| invalid("min-peers", raw))?;
            }
        }
        if filter_types.is_empty() {
            for raw in conf.get("filter-type").into_iter().flatten() {
                let filter_type = FilterType::parse(raw).ok_or_else(|| invalid("filter-type", raw))?;
                if !filter_types.contains(&filter_type) {
                    filter_types.push(filter_type);
                }
            }
        }
        if !max_orphans_set {
            if let Some(raw) = conf_last(&conf, "max-orphans") {
                max_orphans = parse_positive(raw).ok_or_else(|| invalid("max-orphans", raw))?;
            }
        }
        if !orphan_resolve_limit_set {
            if let Some(raw) = conf_last(&conf, "orphan-resolve-limit") {
                orphan_resolve_limit =
                    parse_positive(raw).ok_or_else(|| invalid("orphan-resolve-limit", raw))?;
            }
        }
        if !cfheaders_window_set {
            if let Some(raw) = conf_last(&conf, "cfheaders-window") {
                cfheaders_window = parse_window(raw, MAX_CFHEADERS_PER_MESSAGE)
                    .ok_or_else(|| invalid("cfheaders-window", raw))?;
            }
        }
        if !cfilters_window_set {
            if let Some(raw) = conf_last(&conf, "cfilters-window") {
                cfilters_window = parse_window(raw, MAX_GETCFILTERS_SIZE)
                    .ok_or_else(|| invalid("cfilters-window", raw))?;
            }
        }
        if !tie_break_set {
            if let Some(raw) = conf_last(&conf, "tie-break") {
                tie_break = TieBreak::parse(raw).ok_or_else(|| invalid("tie-break", raw))?;
            }
        }
        if !log_level_set {
            if let Some(raw) = conf_last(&conf, "log-level") {
                log_level = Level::parse(raw).ok_or_else(|| invalid("log-level", raw))?;
            }
        }
        if !log_format_set {
            if let Some(raw) = conf_last(&conf, "log-format") {
                log_format = Format::parse(raw).ok_or_else(|| invalid("log-format", raw))?;
            }
        }
        if !log_timestamps_set {
            if let Some(raw) = conf_last(&conf, "log-timestamps") {
                log_timestamps = parse_conf_bool(raw).ok_or_else(|| invalid("log-timestamps", raw))?;
            }
        }
        if !status_interval_set {
            if let Some(raw) = conf_last(&conf, "status-interval") {
                status_interval_secs = raw.parse().map_err(|_| invalid("status-interval", raw))?;
            }
        }
    }

    let params = chain_params(chain);
    let seednode = match seednode_raw {
        Some(raw) => Some(
            parse_socket_addr_with_default_port(&raw, params.default_port)
                .ok_or_else(|| format!("invalid seednode '{raw}'\n{}", usage()))?,
        ),
        None => None,
    };
    if filter_types.is_empty() {
        filter_types.push(params.default_filter_type);
    }

    Ok(CliAction::Run(Config {
        chain,
        backend,
        data_dir,
        conf_file,
        seednode,
        min_peers,
        filter_types,
        max_orphans,
        orphan_resolve_limit,
        cfheaders_window,
        cfilters_window,
        tie_break,
        log_level,
        log_format,
        log_timestamps,
        status_interval_secs,
    }))
}

fn parse_positive(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|value| *value > 0)
}

/// Request windows are capped at what one protocol message can carry.
fn parse_window(value: &str, max: usize) -> Option<i32> {
    let window = parse_positive(value)?;
    (window <= max).then_some(window as i32)
}

fn conf_last<'a>(conf: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a String> {
    conf.get(key).and_then(|values| values.last())
}

/// Reads `key=value` lines. A missing file is not an error.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find(['#', ';']) {
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
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_socket_addr_with_default_port(value: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    None
}

pub fn usage() -> String {
    [
        "Usage:",
        "  cfsyncd [options]",
        "  cfsyncd <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --chain  Chain to sync (bitcoin|testnet3|bch|bch-testnet3|regtest) (default: bitcoin)",
        "  --backend  Storage backend to use (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/cfsync.conf)",
        "  --seednode  Peer to try before any other (ip or ip:port)",
        "  --min-peers  Connections to keep open (default: 3)",
        "  --filter-type  Compact filter type to sync, repeatable (basic|bch|extended) (default: per chain)",
        "  --max-orphans  Disconnected headers kept before pruning (default: 4096)",
        "  --orphan-resolve-limit  Orphans connected per header batch (default: 2000)",
        "  --cfheaders-window  Blocks per getcfheaders request (default: 2000)",
        "  --cfilters-window  Blocks per getcfilters request (default: 1000)",
        "  --tie-break  Rule for equal-work tips (first-seen|lowest-hash) (default: first-seen)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Timestamps in text logs (true|false) (default: true)",
        "  --status-interval  Seconds between status lines, 0 to disable (default: 15)",
        "",
        "Config file keys use the option names without the leading dashes, e.g. min-peers=8.",
    ]
    .join("\n")
}
