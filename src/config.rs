//! Configuration.
//!
//! The configuration comes from an optional TOML file and the command
//! line, the latter winning wherever both speak. [`Config::config_args`]
//! attaches the arguments to a clap app and
//! [`Config::from_arg_matches`] produces the final configuration.
//! Logging is switched from its startup default to the configured target
//! via [`Config::switch_logging`].

use std::{fmt, fs, io};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use clap::{App, Arg, ArgMatches};
use log::{error, LevelFilter};
use serde::Deserialize;
use crate::error::Failed;


//------------ Defaults ------------------------------------------------------

/// The default port proxies connect to.
pub const DEFAULT_SERVER_PORT: u16 = 17900;

/// The default port of the console.
pub const DEFAULT_CONSOLE_PORT: u16 = 17901;

/// The default keep window in seconds.
///
/// Matches the fifteen minute reboot time of a BGP speaker.
pub const DEFAULT_KEEP_WINDOW: u64 = 900;

/// The default handshake timeout in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 30;


//------------ Config --------------------------------------------------------

/// The server configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The address the proxy listener binds to.
    pub server_addr: IpAddr,

    /// The port the proxy listener binds to.
    pub server_port: u16,

    /// Host and port of the RPKI-RTR cache to consume.
    pub rpki_host: String,
    pub rpki_port: u16,

    /// Host and port of the BGPsec key service.
    pub bgpsec_host: String,
    pub bgpsec_port: u16,

    /// The console port and its password.
    pub console_port: u16,
    pub console_password: Option<String>,

    /// The log level filter.
    pub log_level: LevelFilter,

    /// Where to log to.
    pub log_target: LogTarget,

    /// Send a sync request right after a proxy connected.
    pub sync_after_conn_established: bool,

    /// Write notifications directly instead of via the send queue.
    pub mode_no_sendqueue: bool,

    /// Process PDUs on the receive path instead of via the queue.
    pub mode_no_receivequeue: bool,

    /// How long to keep a disconnected client’s subscriptions.
    pub default_keep_window: Duration,

    /// How long a connection may take to say hello.
    pub handshake_timeout: Duration,

    /// The number of proxies expected to connect.
    pub expected_proxies: u8,

    /// The number of command handler threads. Zero means one per CPU.
    pub command_threads: usize,

    /// The directory holding BGPsec router keys.
    pub keys_dir: Option<PathBuf>,

    /// Static slot-to-proxy-id bindings. Index is the slot; slot 0 unused.
    pub mapping_router_id: Vec<u32>,
}

impl Config {
    /// Adds the configuration arguments to a clap app.
    pub fn config_args<'a: 'b, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        app
        .arg(Arg::with_name("config")
             .short("c")
             .long("config")
             .value_name("FILE")
             .help("read the configuration from this file")
             .takes_value(true)
        )
        .arg(Arg::with_name("addr")
             .short("a")
             .long("addr")
             .value_name("ADDR")
             .help("address to listen on for proxy connections")
             .takes_value(true)
        )
        .arg(Arg::with_name("port")
             .short("p")
             .long("port")
             .value_name("PORT")
             .help("port to listen on for proxy connections")
             .takes_value(true)
        )
        .arg(Arg::with_name("keep-window")
             .short("k")
             .long("keep-window")
             .value_name("SECONDS")
             .help("how long to keep data of disconnected proxies")
             .takes_value(true)
        )
        .arg(Arg::with_name("keys")
             .long("keys")
             .value_name("DIR")
             .help("directory with BGPsec router keys")
             .takes_value(true)
        )
        .arg(Arg::with_name("sync")
             .short("s")
             .long("sync")
             .help("request synchronization after a proxy connects")
        )
        .arg(Arg::with_name("logfile")
             .long("logfile")
             .value_name("PATH")
             .help("log to this file")
             .takes_value(true)
             .conflicts_with("syslog")
        )
        .arg(Arg::with_name("syslog")
             .long("syslog")
             .help("log to syslog")
        )
        .arg(Arg::with_name("verbose")
             .short("v")
             .long("verbose")
             .multiple(true)
             .help("print more (and more) information")
        )
    }

    /// Creates a configuration from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches, cur_dir: &Path
    ) -> Result<Self, Failed> {
        let mut res = match matches.value_of("config") {
            Some(path) => {
                Self::from_config_file(&cur_dir.join(path))?
            }
            None => Self::default(),
        };

        if let Some(addr) = matches.value_of("addr") {
            res.server_addr = IpAddr::from_str(addr).map_err(|_| {
                error!("Invalid listen address '{}'.", addr);
                Failed
            })?;
        }
        if let Some(port) = matches.value_of("port") {
            res.server_port = u16::from_str(port).map_err(|_| {
                error!("Invalid listen port '{}'.", port);
                Failed
            })?;
        }
        if let Some(value) = matches.value_of("keep-window") {
            let secs = u64::from_str(value).map_err(|_| {
                error!(
                    "Invalid keep window '{}'. \
                     Needs to be a number of seconds.",
                    value
                );
                Failed
            })?;
            res.default_keep_window = Duration::from_secs(secs);
        }
        if let Some(path) = matches.value_of("keys") {
            res.keys_dir = Some(cur_dir.join(path));
        }
        if matches.is_present("sync") {
            res.sync_after_conn_established = true;
        }
        if let Some(path) = matches.value_of("logfile") {
            res.log_target = LogTarget::File(cur_dir.join(path));
        }
        else if matches.is_present("syslog") {
            res.log_target = LogTarget::Syslog;
        }
        match matches.occurrences_of("verbose") {
            0 => {}
            1 => res.log_level = LevelFilter::Info,
            _ => res.log_level = LevelFilter::Debug,
        }
        Ok(res)
    }

    /// Reads the configuration from a TOML file.
    pub fn from_config_file(path: &Path) -> Result<Self, Failed> {
        let content = fs::read_to_string(path).map_err(|err| {
            error!(
                "Failed to read config file {}: {}", path.display(), err
            );
            Failed
        })?;
        let file: ConfigFile = toml::from_str(&content).map_err(|err| {
            error!(
                "Failed to parse config file {}: {}", path.display(), err
            );
            Failed
        })?;
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self, Failed> {
        let mut res = Self::default();
        if let Some(addr) = file.server_addr {
            res.server_addr = IpAddr::from_str(&addr).map_err(|_| {
                error!("Invalid server-addr '{}' in config file.", addr);
                Failed
            })?;
        }
        if let Some(port) = file.server_port {
            res.server_port = port;
        }
        if let Some(host) = file.rpki_host {
            res.rpki_host = host;
        }
        if let Some(port) = file.rpki_port {
            res.rpki_port = port;
        }
        if let Some(host) = file.bgpsec_host {
            res.bgpsec_host = host;
        }
        if let Some(port) = file.bgpsec_port {
            res.bgpsec_port = port;
        }
        if let Some(port) = file.console_port {
            res.console_port = port;
        }
        res.console_password = file.console_password;
        if let Some(level) = file.log_level {
            res.log_level = LevelFilter::from_str(&level).map_err(|_| {
                error!("Invalid log-level '{}' in config file.", level);
                Failed
            })?;
        }
        if let Some(path) = file.log_file {
            res.log_target = LogTarget::File(path);
        }
        else if file.syslog.unwrap_or(false) {
            res.log_target = LogTarget::Syslog;
        }
        if let Some(value) = file.sync {
            res.sync_after_conn_established = value;
        }
        if let Some(value) = file.mode_no_sendqueue {
            res.mode_no_sendqueue = value;
        }
        if let Some(value) = file.mode_no_receivequeue {
            res.mode_no_receivequeue = value;
        }
        if let Some(secs) = file.keep_window {
            res.default_keep_window = Duration::from_secs(secs);
        }
        if let Some(secs) = file.handshake_timeout {
            res.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(count) = file.expected_proxies {
            res.expected_proxies = count;
        }
        if let Some(count) = file.command_threads {
            res.command_threads = count;
        }
        if let Some(path) = file.keys_dir {
            res.keys_dir = Some(path);
        }
        if let Some(mapping) = file.mapping_router_id {
            if mapping.len() > 256 {
                error!(
                    "mapping-router-id in config file has {} entries, \
                     at most 256 are allowed.",
                    mapping.len()
                );
                return Err(Failed)
            }
            res.mapping_router_id.splice(..mapping.len(), mapping);
        }
        Ok(res)
    }

    /// Returns the effective number of command handler threads.
    pub fn effective_command_threads(&self) -> usize {
        if self.command_threads == 0 {
            num_cpus::get()
        }
        else {
            self.command_threads
        }
    }

    /// Switches logging to the configured target.
    ///
    /// Called once at startup after the configuration is final. Requires
    /// [`init_logging`] to have run.
    pub fn switch_logging(&self) -> Result<(), Failed> {
        let logger = match self.log_target {
            LogTarget::Stderr => {
                fern::Dispatch::new()
                    .level(self.log_level)
                    .format(|out, message, record| {
                        out.finish(format_args!(
                            "[{}] {}", record.level(), message
                        ))
                    })
                    .chain(io::stderr())
                    .into_log().1
            }
            LogTarget::File(ref path) => {
                let file = fern::log_file(path).map_err(|err| {
                    error!(
                        "Failed to open log file {}: {}",
                        path.display(), err
                    );
                    Failed
                })?;
                fern::Dispatch::new()
                    .level(self.log_level)
                    .format(|out, message, record| {
                        out.finish(format_args!(
                            "{} [{}] {}",
                            chrono::Local::now()
                                .format("%Y-%m-%d %H:%M:%S"),
                            record.level(), message
                        ))
                    })
                    .chain(file)
                    .into_log().1
            }
            LogTarget::Syslog => self.syslog_logger()?,
        };
        log_reroute::reroute_boxed(logger);
        log::set_max_level(self.log_level);
        Ok(())
    }

    #[cfg(unix)]
    fn syslog_logger(&self) -> Result<Box<dyn log::Log>, Failed> {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "srx-server".into(),
            pid: 0,
        };
        let logger = syslog::unix(formatter).map_err(|err| {
            error!("Failed to connect to syslog: {}", err);
            Failed
        })?;
        Ok(Box::new(syslog::BasicLogger::new(logger)))
    }

    #[cfg(not(unix))]
    fn syslog_logger(&self) -> Result<Box<dyn log::Log>, Failed> {
        error!("Syslog is not available on this platform.");
        Err(Failed)
    }
}


//------------ init_logging --------------------------------------------------

/// Initializes logging as early as possible.
///
/// All diagnostic output goes through the log, so this has to run before
/// anything that may want to complain. Until the configuration is parsed
/// and [`Config::switch_logging`] takes over, errors go to stderr.
pub fn init_logging() -> Result<(), Failed> {
    log::set_max_level(LevelFilter::Warn);
    if let Err(err) = log_reroute::init() {
        eprintln!("Failed to initialize logger: {}.\nAborting.", err);
        return Err(Failed)
    }
    let logger = fern::Dispatch::new()
        .level(LevelFilter::Error)
        .chain(io::stderr())
        .into_log().1;
    log_reroute::reroute_boxed(logger);
    Ok(())
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_addr: IpAddr::from_str("0.0.0.0").expect("valid literal"),
            server_port: DEFAULT_SERVER_PORT,
            rpki_host: "localhost".into(),
            rpki_port: 323,
            bgpsec_host: "localhost".into(),
            bgpsec_port: 0,
            console_port: DEFAULT_CONSOLE_PORT,
            console_password: None,
            log_level: LevelFilter::Warn,
            log_target: LogTarget::Stderr,
            sync_after_conn_established: false,
            mode_no_sendqueue: false,
            mode_no_receivequeue: false,
            default_keep_window: Duration::from_secs(DEFAULT_KEEP_WINDOW),
            handshake_timeout: Duration::from_secs(
                DEFAULT_HANDSHAKE_TIMEOUT
            ),
            expected_proxies: 8,
            command_threads: 1,
            keys_dir: None,
            mapping_router_id: vec![0; 256],
        }
    }
}


//------------ LogTarget -----------------------------------------------------

/// Where the log output should end up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogTarget {
    /// Standard error.
    Stderr,

    /// A file.
    File(PathBuf),

    /// The system log. Unix only.
    Syslog,
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LogTarget::Stderr => f.write_str("stderr"),
            LogTarget::File(ref path) => write!(f, "{}", path.display()),
            LogTarget::Syslog => f.write_str("syslog"),
        }
    }
}


//------------ ConfigFile ----------------------------------------------------

/// The content of the TOML configuration file.
///
/// Everything is optional; missing values keep their default.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    server_addr: Option<String>,
    server_port: Option<u16>,
    rpki_host: Option<String>,
    rpki_port: Option<u16>,
    bgpsec_host: Option<String>,
    bgpsec_port: Option<u16>,
    console_port: Option<u16>,
    console_password: Option<String>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    syslog: Option<bool>,
    sync: Option<bool>,
    mode_no_sendqueue: Option<bool>,
    mode_no_receivequeue: Option<bool>,
    keep_window: Option<u64>,
    handshake_timeout: Option<u64>,
    expected_proxies: Option<u8>,
    command_threads: Option<usize>,
    keys_dir: Option<PathBuf>,
    mapping_router_id: Option<Vec<u32>>,
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(content: &str) -> Result<Config, Failed> {
        Config::from_file(
            toml::from_str::<ConfigFile>(content).expect("parses")
        )
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(
            config.default_keep_window,
            Duration::from_secs(DEFAULT_KEEP_WINDOW)
        );
        assert_eq!(config.log_target, LogTarget::Stderr);
        assert_eq!(config.mapping_router_id.len(), 256);
    }

    #[test]
    fn file_values_override_defaults() {
        let config = from_toml(
            "server-port = 1790\n\
             rpki-host = \"rtr.example.net\"\n\
             rpki-port = 8323\n\
             sync = true\n\
             keep-window = 300\n\
             log-level = \"debug\"\n\
             mapping-router-id = [0, 1042]\n"
        ).expect("valid config");
        assert_eq!(config.server_port, 1790);
        assert_eq!(config.rpki_host, "rtr.example.net");
        assert_eq!(config.rpki_port, 8323);
        assert!(config.sync_after_conn_established);
        assert_eq!(
            config.default_keep_window, Duration::from_secs(300)
        );
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.mapping_router_id[1], 1042);
        assert_eq!(config.mapping_router_id.len(), 256);
    }

    #[test]
    fn oversized_mapping_is_refused() {
        let mapping: Vec<String> = (0..257).map(|_| "0".into()).collect();
        let content = format!(
            "mapping-router-id = [{}]", mapping.join(", ")
        );
        assert!(from_toml(&content).is_err());
    }

    #[test]
    fn unknown_keys_are_refused() {
        assert!(
            toml::from_str::<ConfigFile>("no-such-key = 1").is_err()
        );
    }
}
