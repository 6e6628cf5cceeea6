use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dltrelay_daemon::{Daemon, DaemonConfig, RingBufferConfig};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, RunArgs};
use crate::exit::{daemon_error, CliResult, SUCCESS};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub fn run(args: RunArgs) -> CliResult<i32> {
    let config = daemon_config(args);
    let shutdown = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(shutdown.clone())?;

    let daemon = Daemon::spawn(config, shutdown.clone())
        .map_err(|err| daemon_error("daemon failed to start", err))?;
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(SHUTDOWN_POLL);
    }
    info!("shutdown requested");
    daemon.join();
    Ok(SUCCESS)
}

fn daemon_config(args: RunArgs) -> DaemonConfig {
    DaemonConfig {
        ecu_id: args.ecu_id,
        producer_socket: args.producer_socket,
        consumer_endpoint: args.consumer_endpoint,
        socket_mode: args.socket_mode,
        ring_buffer: RingBufferConfig {
            min_size: args.ring_buffer_min,
            max_size: args.ring_buffer_max,
            step_size: args.ring_buffer_step,
        },
        default_log_level: args.default_log_level,
        default_trace_status: args.default_trace_status,
        force_ceiling: args.force_ceiling,
        stamp_ecu_id: args.stamp_ecu_id,
        send_timeout: args.send_timeout,
        flush_interval: args.flush_interval,
        offline_trace: args.offline_trace,
        logging_disabled_ok: !args.strict_delivery,
        auto_log_info: args.auto_log_info,
        send_software_version: args.send_software_version,
        send_timezone: args.send_timezone,
        runtime_directory: args.runtime_directory,
        timing_packets: args.timing_packets,
        ..DaemonConfig::default()
    }
}
