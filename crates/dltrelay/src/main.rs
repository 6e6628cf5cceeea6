mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "dltrelay", version, about = "DLT log relay daemon and tools")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::ControlRequest;
    use dltrelay_frame::Id4;
    use dltrelay_transport::Endpoint;

    #[test]
    fn parses_run_with_tcp_viewers() {
        let cli = Cli::try_parse_from([
            "dltrelay",
            "run",
            "--consumer-endpoint",
            "tcp://127.0.0.1:3490",
            "--ring-buffer-max",
            "2000000",
            "--force-ceiling",
        ])
        .expect("run args should parse");

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            args.consumer_endpoint,
            Endpoint::Tcp("127.0.0.1:3490".to_string())
        );
        assert_eq!(args.ring_buffer_max, 2_000_000);
        assert!(args.force_ceiling);
        assert_eq!(args.default_log_level, 4);
    }

    #[test]
    fn parses_negative_level_for_set_log_level() {
        let cli = Cli::try_parse_from([
            "dltrelay",
            "control",
            "--endpoint",
            "/tmp/ctrl.sock",
            "set-log-level",
            "APP",
            "CTX",
            "-1",
        ])
        .expect("control args should parse");

        let Command::Control(args) = cli.command else {
            panic!("expected control");
        };
        assert!(matches!(
            args.request,
            ControlRequest::SetLogLevel { apid, level: -1, .. } if apid == Id4::new("APP")
        ));
    }

    #[test]
    fn rejects_out_of_range_levels() {
        let err = Cli::try_parse_from(["dltrelay", "control", "set-log-level", "APP", "CTX", "7"])
            .expect_err("level 7 should be rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let err = Cli::try_parse_from(["dltrelay", "log", "hi", "--level", "0"])
            .expect_err("level 0 should be rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn rejects_bad_endpoints() {
        let err = Cli::try_parse_from(["dltrelay", "receive", "tcp://nohost"])
            .expect_err("endpoint without port should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
