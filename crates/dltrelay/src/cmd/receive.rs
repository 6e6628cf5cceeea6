use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dltrelay_frame::{decode_message, find_serial_header, FrameError, Receiver};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, ReceiveArgs};
use crate::exit::{frame_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

const READ_POLL: Duration = Duration::from_millis(200);

pub fn run(args: ReceiveArgs, format: OutputFormat) -> CliResult<i32> {
    let mut stream = args
        .endpoint
        .connect()
        .map_err(|err| transport_error("connect failed", err))?;
    stream
        .set_read_timeout(Some(READ_POLL))
        .map_err(|err| transport_error("socket setup failed", err))?;

    let stop = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(stop.clone())?;

    let mut receiver = Receiver::new();
    let mut printed = 0usize;
    while !stop.load(Ordering::SeqCst) {
        match receiver.receive_from(&mut stream) {
            Ok(_) => {}
            Err(FrameError::ConnectionClosed) => {
                info!(endpoint = %args.endpoint, "daemon closed the connection");
                break;
            }
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => return Err(frame_error("receive failed", err)),
        }

        loop {
            let (message, used) = match decode_message(receiver.as_slice()) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(err) => {
                    let skip = resync_offset(receiver.as_slice());
                    warn!(error = %err, skipped = skip, "malformed message");
                    receiver.remove(skip);
                    continue;
                }
            };
            receiver.remove(used);
            if args.logs_only && message.is_control() {
                continue;
            }

            print_message(&message, format);
            printed = printed.saturating_add(1);
            if args.count.is_some_and(|count| printed >= count) {
                return Ok(SUCCESS);
            }
        }
    }

    Ok(SUCCESS)
}

/// Bytes to drop so the next serial header, if any, leads the buffer.
fn resync_offset(buffered: &[u8]) -> usize {
    buffered
        .get(1..)
        .and_then(find_serial_header)
        .map_or(buffered.len(), |pos| pos + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_skips_to_the_next_serial_header() {
        assert_eq!(resync_offset(b"DLS\x01\x35garbageDLS\x01"), 12);
        assert_eq!(resync_offset(b"\x35\x00\x00\x02"), 4);
        assert_eq!(resync_offset(b""), 0);
    }
}
