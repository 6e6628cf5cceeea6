use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use dltrelay_daemon::config::{DEFAULT_CONSUMER_SOCKET, DEFAULT_PRODUCER_SOCKET};
use dltrelay_frame::Id4;
use dltrelay_transport::Endpoint;

use crate::exit::{CliError, CliResult, INTERNAL};
#[cfg(not(unix))]
use crate::exit::USAGE;
use crate::output::OutputFormat;

pub mod control;
#[cfg(unix)]
pub mod log;
pub mod receive;
#[cfg(unix)]
pub mod run;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon until interrupted.
    Run(Box<RunArgs>),
    /// Connect as a log viewer and print received messages.
    Receive(ReceiveArgs),
    /// Register as an application and emit log messages.
    Log(LogArgs),
    /// Send one control request and print the response.
    Control(ControlArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        #[cfg(unix)]
        Command::Run(args) => run::run(*args),
        #[cfg(unix)]
        Command::Log(args) => log::run(args),
        #[cfg(not(unix))]
        Command::Run(_) | Command::Log(_) => {
            Err(CliError::new(USAGE, "application sockets need a Unix platform"))
        }
        Command::Receive(args) => receive::run(args, format),
        Command::Control(args) => control::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// ECU id stamped on daemon messages.
    #[arg(long, env = "DLTRELAY_ECU_ID", default_value = "ECU1")]
    pub ecu_id: Id4,
    /// Socket applications connect to.
    #[arg(long, env = "DLTRELAY_PRODUCER_SOCKET", default_value = DEFAULT_PRODUCER_SOCKET)]
    pub producer_socket: PathBuf,
    /// Where log viewers connect: a socket path or tcp://host:port.
    #[arg(long, env = "DLTRELAY_CONSUMER_ENDPOINT", default_value = DEFAULT_CONSUMER_SOCKET)]
    pub consumer_endpoint: Endpoint,
    /// Permission bits of the created sockets, in octal.
    #[arg(long, env = "DLTRELAY_SOCKET_MODE", default_value = "666", value_parser = parse_octal)]
    pub socket_mode: u32,
    /// Initial ring buffer size in bytes.
    #[arg(long, env = "DLTRELAY_RING_BUFFER_MIN", default_value_t = 500_000)]
    pub ring_buffer_min: usize,
    /// Upper bound of the ring buffer in bytes.
    #[arg(long, env = "DLTRELAY_RING_BUFFER_MAX", default_value_t = 10_000_000)]
    pub ring_buffer_max: usize,
    /// Growth step of the ring buffer in bytes.
    #[arg(long, env = "DLTRELAY_RING_BUFFER_STEP", default_value_t = 500_000)]
    pub ring_buffer_step: usize,
    /// Level of contexts registered with the default level (0-6).
    #[arg(long, env = "DLTRELAY_DEFAULT_LOG_LEVEL", default_value_t = 4,
          value_parser = clap::value_parser!(i8).range(0..=6))]
    pub default_log_level: i8,
    /// Trace status of contexts registered with the default status (0-1).
    #[arg(long, env = "DLTRELAY_DEFAULT_TRACE_STATUS", default_value_t = 0,
          value_parser = clap::value_parser!(i8).range(0..=1))]
    pub default_trace_status: i8,
    /// Never let a context exceed the default level and status.
    #[arg(long, env = "DLTRELAY_FORCE_CEILING")]
    pub force_ceiling: bool,
    /// Overwrite the ECU of every application message.
    #[arg(long, env = "DLTRELAY_STAMP_ECU_ID")]
    pub stamp_ecu_id: bool,
    /// Longest a single write to a viewer may block (e.g. 4s, 500ms).
    #[arg(long, env = "DLTRELAY_SEND_TIMEOUT", default_value = "4s", value_parser = parse_duration)]
    pub send_timeout: Duration,
    /// Period of the buffer flush.
    #[arg(long, env = "DLTRELAY_FLUSH_INTERVAL", default_value = "100ms", value_parser = parse_duration)]
    pub flush_interval: Duration,
    /// Append every distributed message to this file.
    #[arg(long, env = "DLTRELAY_OFFLINE_TRACE", value_name = "FILE")]
    pub offline_trace: Option<PathBuf>,
    /// Directory of the persisted levels and logging mode.
    #[arg(long, env = "DLTRELAY_RUNTIME_DIRECTORY", value_name = "DIR")]
    pub runtime_directory: Option<PathBuf>,
    /// Report a failed delivery when no viewer is attached.
    #[arg(long, env = "DLTRELAY_STRICT_DELIVERY")]
    pub strict_delivery: bool,
    /// Announce every registered context with a GET_LOG_INFO response.
    #[arg(long, env = "DLTRELAY_AUTO_LOG_INFO")]
    pub auto_log_info: bool,
    /// Send the software version to each new viewer.
    #[arg(long, env = "DLTRELAY_SEND_SOFTWARE_VERSION")]
    pub send_software_version: bool,
    /// Send the timezone to each new viewer.
    #[arg(long, env = "DLTRELAY_SEND_TIMEZONE")]
    pub send_timezone: bool,
    /// Send a timing packet every second.
    #[arg(long, env = "DLTRELAY_TIMING_PACKETS")]
    pub timing_packets: bool,
}

#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// Socket path or tcp://host:port of the daemon.
    #[arg(env = "DLTRELAY_CONSUMER_ENDPOINT", default_value = DEFAULT_CONSUMER_SOCKET)]
    pub endpoint: Endpoint,
    /// Exit after N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Skip control messages.
    #[arg(long)]
    pub logs_only: bool,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Text payload of each message.
    pub message: String,
    /// Application socket of the daemon.
    #[arg(long, env = "DLTRELAY_PRODUCER_SOCKET", default_value = DEFAULT_PRODUCER_SOCKET)]
    pub socket: PathBuf,
    /// Application id.
    #[arg(long, default_value = "LOG")]
    pub apid: Id4,
    /// Context id.
    #[arg(long, default_value = "TEST")]
    pub ctid: Id4,
    /// Message level: 1 fatal, 2 error, 3 warn, 4 info, 5 debug, 6 verbose.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=6))]
    pub level: u8,
    /// Number of messages to send.
    #[arg(long, default_value_t = 1)]
    pub count: usize,
    /// Pause between messages (e.g. 10ms).
    #[arg(long, value_parser = parse_duration)]
    pub interval: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct ControlArgs {
    /// Socket path or tcp://host:port of the daemon.
    #[arg(long, env = "DLTRELAY_CONSUMER_ENDPOINT", default_value = DEFAULT_CONSUMER_SOCKET)]
    pub endpoint: Endpoint,
    /// How long to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,
    #[command(subcommand)]
    pub request: ControlRequest,
}

#[derive(Subcommand, Debug)]
pub enum ControlRequest {
    /// Set the level of matching contexts (-1 restores the default).
    SetLogLevel {
        apid: Id4,
        ctid: Id4,
        #[arg(allow_hyphen_values = true, value_parser = clap::value_parser!(i8).range(-1..=6))]
        level: i8,
    },
    /// Set the trace status of matching contexts (-1 restores the default).
    SetTraceStatus {
        apid: Id4,
        ctid: Id4,
        #[arg(allow_hyphen_values = true, value_parser = clap::value_parser!(i8).range(-1..=1))]
        status: i8,
    },
    /// List registered applications and contexts.
    GetLogInfo {
        /// Only this application; all when omitted.
        #[arg(long)]
        apid: Option<Id4>,
        /// Only this context of the application.
        #[arg(long)]
        ctid: Option<Id4>,
        /// 3 ids only, 4 with level, 5 with status, 6 both, 7 with descriptions.
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u8).range(3..=7))]
        options: u8,
    },
    /// Print the default log level.
    GetDefaultLogLevel,
    /// Print the daemon software version.
    GetSoftwareVersion,
    /// Persist the current levels.
    StoreConfig,
    /// Delete the persisted levels and restore the defaults.
    ResetToFactoryDefault,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Set `flag` on Ctrl-C.
pub(crate) fn install_ctrlc_handler(flag: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

/// Parse `5s`, `500ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {input:?}"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

fn parse_octal(input: &str) -> Result<u32, String> {
    let digits = input.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o777)
        .ok_or_else(|| format!("invalid socket mode: {input:?}"))
}
