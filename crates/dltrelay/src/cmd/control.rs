use std::io::{ErrorKind, Write};
use std::time::{Duration, Instant};

use dltrelay_daemon::{CONTROL_APID, CONTROL_CTID};
use dltrelay_frame::header::msin;
use dltrelay_frame::service::{
    self, decode_log_info, id, status, GetLogInfoRequest, SetLevelRequest,
};
use dltrelay_frame::{decode_message, FrameError, Id4, Message, Receiver};
use tracing::debug;

use crate::cmd::{ControlArgs, ControlRequest};
use crate::exit::{
    frame_error, io_error, transport_error, CliError, CliResult, REQUEST_REJECTED, SUCCESS,
    TIMEOUT,
};
use crate::output::{
    contexts_from_log_info, print_response, status_name, OutputFormat, ResponseOutput,
};

/// ECU id this tool puts on its requests.
const TOOL_ECU: Id4 = Id4::from_bytes(*b"DLTR");
const READ_POLL: Duration = Duration::from_millis(100);

pub fn run(args: ControlArgs, format: OutputFormat) -> CliResult<i32> {
    let (service_id, payload) = request_payload(&args.request);
    let request = Message::control(
        TOOL_ECU,
        0,
        msin::REQUEST,
        CONTROL_APID,
        CONTROL_CTID,
        payload,
    );
    let bytes = request
        .to_network_bytes()
        .map_err(|err| frame_error("encode failed", err))?;

    let mut stream = args
        .endpoint
        .connect()
        .map_err(|err| transport_error("connect failed", err))?;
    stream
        .set_read_timeout(Some(READ_POLL))
        .map_err(|err| transport_error("socket setup failed", err))?;
    stream
        .write_all(&bytes)
        .map_err(|err| io_error("request failed", err))?;
    debug!(service = service::service_name(service_id), "request sent");

    let deadline = Instant::now() + args.timeout;
    let mut receiver = Receiver::new();
    loop {
        while let Some((message, used)) =
            decode_message(receiver.as_slice()).map_err(|err| frame_error("bad response", err))?
        {
            receiver.remove(used);
            if is_response_to(&message, service_id) {
                let response = describe(service_id, &message.payload);
                print_response(&response, format);
                return Ok(exit_code(service_id, &message.payload));
            }
        }

        if Instant::now() >= deadline {
            return Err(CliError::new(
                TIMEOUT,
                format!(
                    "no {} response within {:?}",
                    service::service_name(service_id),
                    args.timeout
                ),
            ));
        }
        match receiver.receive_from(&mut stream) {
            Ok(_) => {}
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(frame_error("receive failed", err)),
        }
    }
}

/// Service id and request payload for one command.
fn request_payload(request: &ControlRequest) -> (u32, Vec<u8>) {
    match *request {
        ControlRequest::SetLogLevel { apid, ctid, level } => (
            id::SET_LOG_LEVEL,
            SetLevelRequest {
                apid,
                ctid,
                value: level as u8,
            }
            .encode(id::SET_LOG_LEVEL)
            .to_vec(),
        ),
        ControlRequest::SetTraceStatus { apid, ctid, status } => (
            id::SET_TRACE_STATUS,
            SetLevelRequest {
                apid,
                ctid,
                value: status as u8,
            }
            .encode(id::SET_TRACE_STATUS)
            .to_vec(),
        ),
        ControlRequest::GetLogInfo {
            apid,
            ctid,
            options,
        } => (
            id::GET_LOG_INFO,
            GetLogInfoRequest {
                options,
                apid: apid.unwrap_or_default(),
                ctid: ctid.unwrap_or_default(),
            }
            .encode()
            .to_vec(),
        ),
        ControlRequest::GetDefaultLogLevel => bare(id::GET_DEFAULT_LOG_LEVEL),
        ControlRequest::GetSoftwareVersion => bare(id::GET_SOFTWARE_VERSION),
        ControlRequest::StoreConfig => bare(id::STORE_CONFIG),
        ControlRequest::ResetToFactoryDefault => bare(id::RESET_TO_FACTORY_DEFAULT),
    }
}

fn bare(service_id: u32) -> (u32, Vec<u8>) {
    (service_id, service_id.to_le_bytes().to_vec())
}

fn is_response_to(message: &Message, service_id: u32) -> bool {
    message
        .extended
        .is_some_and(|ext| ext.is_control() && ext.subtype() == msin::CONTROL_RESPONSE)
        && service::request_service_id(&message.payload, message.is_big_endian())
            == Some(service_id)
}

fn response_status(payload: &[u8]) -> u8 {
    payload.get(4).copied().unwrap_or(status::ERROR)
}

fn describe(service_id: u32, payload: &[u8]) -> ResponseOutput {
    let status = response_status(payload);
    let mut out = ResponseOutput {
        service: service::service_name(service_id),
        status: status_name(status),
        value: None,
        text: None,
        contexts: Vec::new(),
    };
    match service_id {
        id::GET_DEFAULT_LOG_LEVEL if status == status::OK => out.value = payload.get(5).copied(),
        id::GET_SOFTWARE_VERSION if status == status::OK => out.text = software_version(payload),
        id::GET_LOG_INFO => {
            if let Some((options, applications)) = decode_log_info(payload) {
                out.contexts = contexts_from_log_info(options, &applications);
            }
        }
        _ => {}
    }
    out
}

fn software_version(payload: &[u8]) -> Option<String> {
    let len = u32::from_le_bytes(payload.get(5..9)?.try_into().ok()?) as usize;
    let text = payload.get(9..9usize.checked_add(len)?)?;
    Some(String::from_utf8_lossy(text).trim_end_matches('\0').to_string())
}

fn exit_code(service_id: u32, payload: &[u8]) -> i32 {
    match response_status(payload) {
        status::OK => SUCCESS,
        3..=7 if service_id == id::GET_LOG_INFO => SUCCESS,
        _ => REQUEST_REJECTED,
    }
}
