use std::path::PathBuf;
use std::time::Duration;

use dltrelay_frame::Id4;
use dltrelay_transport::Endpoint;

use crate::registry::RegistrySettings;
use crate::ring_buffer::RingBufferConfig;

pub const DEFAULT_ECU_ID: &str = "ECU1";
pub const DEFAULT_PRODUCER_SOCKET: &str = "/tmp/dlt-app.sock";
pub const DEFAULT_CONSUMER_SOCKET: &str = "/tmp/dlt-ctrl.sock";
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// ECU id stamped on messages and used for daemon-generated messages.
    pub ecu_id: Id4,
    /// Socket producers connect to.
    pub producer_socket: PathBuf,
    /// Where consumers connect: a socket path or `tcp://host:port`.
    pub consumer_endpoint: Endpoint,
    /// Permission bits of created Unix sockets.
    pub socket_mode: u32,
    /// Ring buffer limits.
    pub ring_buffer: RingBufferConfig,
    /// Level for contexts registered with "default".
    pub default_log_level: i8,
    /// Trace status for contexts registered with "default".
    pub default_trace_status: i8,
    /// Never let a context exceed the default level and status.
    pub force_ceiling: bool,
    /// Overwrite the storage header ECU of every producer message.
    pub stamp_ecu_id: bool,
    /// Bound for one write to a consumer before the consumer is dropped.
    pub send_timeout: Duration,
    /// Period of the buffer flush and the timing packet check.
    pub flush_interval: Duration,
    /// A serial consumer is attached from the start.
    pub serial_consumer: bool,
    /// File receiving every delivered message in stored form.
    pub offline_trace: Option<PathBuf>,
    /// Zero consumers in direct delivery counts as success.
    pub logging_disabled_ok: bool,
    /// Answer every context registration with a GET_LOG_INFO response.
    pub auto_log_info: bool,
    /// Options mode of the automatic GET_LOG_INFO response.
    pub auto_log_info_option: u8,
    /// Send the software version to each new consumer.
    pub send_software_version: bool,
    /// Send the timezone to each new consumer.
    pub send_timezone: bool,
    /// Reply to GET_SOFTWARE_VERSION.
    pub software_version: String,
    /// Directory of the runtime configuration files; none disables
    /// persistence.
    pub runtime_directory: Option<PathBuf>,
    /// Send a CONTROL/TIME message every second.
    pub timing_packets: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ecu_id: Id4::new(DEFAULT_ECU_ID),
            producer_socket: PathBuf::from(DEFAULT_PRODUCER_SOCKET),
            consumer_endpoint: Endpoint::Unix(PathBuf::from(DEFAULT_CONSUMER_SOCKET)),
            socket_mode: 0o666,
            ring_buffer: RingBufferConfig::default(),
            default_log_level: 4,
            default_trace_status: 0,
            force_ceiling: false,
            stamp_ecu_id: false,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            serial_consumer: false,
            offline_trace: None,
            logging_disabled_ok: true,
            auto_log_info: false,
            auto_log_info_option: 7,
            send_software_version: false,
            send_timezone: false,
            software_version: format!("dltrelay {}", env!("CARGO_PKG_VERSION")),
            runtime_directory: None,
            timing_packets: false,
        }
    }
}

impl DaemonConfig {
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            default_log_level: self.default_log_level,
            default_trace_status: self.default_trace_status,
            force_ceiling: self.force_ceiling,
            runtime_config_loaded: false,
        }
    }
}
