use std::io::Write;
use std::thread;

use dltrelay_frame::envelope::{RegisterApplication, RegisterContext};
use dltrelay_frame::header::msin;
use dltrelay_frame::{Message, UserMessage};
use dltrelay_transport::{IpcStream, UnixDomainSocket};
use tracing::info;

use crate::cmd::LogArgs;
use crate::exit::{frame_error, io_error, transport_error, CliResult, SUCCESS};

/// Level and status value asking the daemon for its defaults.
const USE_DEFAULT: i8 = -1;

pub fn run(args: LogArgs) -> CliResult<i32> {
    let mut stream = UnixDomainSocket::connect(&args.socket)
        .map_err(|err| transport_error("connect failed", err))?;
    let pid = std::process::id() as i32;

    send(
        &mut stream,
        &UserMessage::RegisterApplication(RegisterApplication {
            apid: args.apid,
            pid,
            description: "dltrelay log".to_string(),
        }),
    )?;
    send(
        &mut stream,
        &UserMessage::RegisterContext(RegisterContext {
            apid: args.apid,
            ctid: args.ctid,
            log_level_pos: 0,
            log_level: USE_DEFAULT,
            trace_status: USE_DEFAULT,
            pid,
            description: "command line".to_string(),
        }),
    )?;

    for n in 0..args.count {
        if n > 0 {
            if let Some(interval) = args.interval {
                thread::sleep(interval);
            }
        }
        send(&mut stream, &UserMessage::Log(log_message(&args, n)))?;
    }

    send(
        &mut stream,
        &UserMessage::UnregisterContext {
            apid: args.apid,
            ctid: args.ctid,
            pid,
        },
    )?;
    send(
        &mut stream,
        &UserMessage::UnregisterApplication {
            apid: args.apid,
            pid,
        },
    )?;
    info!(apid = %args.apid, ctid = %args.ctid, count = args.count, "messages sent");
    Ok(SUCCESS)
}

fn log_message(args: &LogArgs, n: usize) -> Message {
    let mut message = Message::log(
        args.apid,
        args.ctid,
        (n % 256) as u8,
        args.message.clone().into_bytes(),
    );
    if let Some(extended) = message.extended.as_mut() {
        extended.msin = msin::compose(msin::TYPE_LOG, args.level);
    }
    message
}

fn send(stream: &mut IpcStream, message: &UserMessage) -> CliResult<()> {
    let bytes = message
        .to_bytes()
        .map_err(|err| frame_error("encode failed", err))?;
    stream
        .write_all(&bytes)
        .map_err(|err| io_error("write failed", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dltrelay_frame::Id4;
    use std::path::PathBuf;

    #[test]
    fn messages_carry_level_and_wrapping_counter() {
        let args = LogArgs {
            message: "hello".to_string(),
            socket: PathBuf::from("/tmp/unused.sock"),
            apid: Id4::new("APP"),
            ctid: Id4::new("CTX"),
            level: 2,
            count: 1,
            interval: None,
        };
        let message = log_message(&args, 257);
        let extended = message.extended.expect("log messages have an extended header");
        assert_eq!(extended.message_type(), msin::TYPE_LOG);
        assert_eq!(extended.subtype(), 2);
        assert_eq!(message.counter, 1);
        assert_eq!(&message.payload[..], b"hello");
    }
}
