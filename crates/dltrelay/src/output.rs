use std::fmt::Write as _;
use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use dltrelay_frame::header::msin;
use dltrelay_frame::service::{self, LogInfoApplication};
use dltrelay_frame::Message;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput {
    ecu: String,
    timestamp: Option<u32>,
    counter: u8,
    kind: &'static str,
    apid: String,
    ctid: String,
    service: Option<&'static str>,
    payload_size: usize,
    payload: String,
}

impl MessageOutput {
    fn new(message: &Message) -> Self {
        let service = message
            .is_control()
            .then(|| service::request_service_id(&message.payload, message.is_big_endian()))
            .flatten()
            .map(service::service_name);
        Self {
            ecu: message.extra.ecu.unwrap_or(message.storage.ecu).to_string(),
            timestamp: message.extra.timestamp,
            counter: message.counter,
            kind: message_kind(message),
            apid: message.apid().map(|id| id.to_string()).unwrap_or_default(),
            ctid: message.ctid().map(|id| id.to_string()).unwrap_or_default(),
            service,
            payload_size: message.payload.len(),
            payload: if message.is_control() {
                hex(&message.payload)
            } else {
                payload_preview(&message.payload)
            },
        }
    }
}

pub fn print_message(message: &Message, format: OutputFormat) {
    if let OutputFormat::Raw = format {
        match message.to_network_bytes() {
            Ok(bytes) => print_raw(&bytes),
            Err(err) => tracing::warn!(error = %err, "message not re-encodable"),
        }
        return;
    }

    let out = MessageOutput::new(message);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ECU", "TIME", "CNT", "TYPE", "APID", "CTID", "PAYLOAD"])
                .add_row(vec![
                    out.ecu,
                    out.timestamp.map(format_uptime).unwrap_or_default(),
                    out.counter.to_string(),
                    out.kind.to_string(),
                    out.apid,
                    out.ctid,
                    out.service.map(str::to_string).unwrap_or(out.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} {} #{} {} {}:{} {}",
                out.ecu,
                out.timestamp.map(format_uptime).unwrap_or_else(|| "-".to_string()),
                out.counter,
                out.kind,
                out.apid,
                out.ctid,
                out.service.map(str::to_string).unwrap_or(out.payload)
            );
        }
        OutputFormat::Raw => {}
    }
}

/// A decoded control response.
#[derive(Debug, Serialize)]
pub struct ResponseOutput {
    pub service: &'static str,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<ContextOutput>,
}

#[derive(Debug, Serialize)]
pub struct ContextOutput {
    pub apid: String,
    pub ctid: String,
    pub log_level: Option<i8>,
    pub trace_status: Option<i8>,
    pub description: String,
}

/// Flatten GET_LOG_INFO applications into one row per context.
pub fn contexts_from_log_info(options: u8, applications: &[LogInfoApplication]) -> Vec<ContextOutput> {
    let with_level = matches!(options, 4 | 6 | 7);
    let with_status = matches!(options, 5 | 6 | 7);
    applications
        .iter()
        .flat_map(|app| {
            app.contexts.iter().map(move |ctx| ContextOutput {
                apid: app.apid.to_string(),
                ctid: ctx.ctid.to_string(),
                log_level: with_level.then_some(ctx.log_level),
                trace_status: with_status.then_some(ctx.trace_status),
                description: ctx.description.clone(),
            })
        })
        .collect()
}

pub fn print_response(response: &ResponseOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(response),
        OutputFormat::Table if !response.contexts.is_empty() => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["APID", "CTID", "LEVEL", "STATUS", "DESCRIPTION"]);
            for ctx in &response.contexts {
                table.add_row(vec![
                    ctx.apid.clone(),
                    ctx.ctid.clone(),
                    ctx.log_level.map(|v| v.to_string()).unwrap_or_default(),
                    ctx.trace_status.map(|v| v.to_string()).unwrap_or_default(),
                    ctx.description.clone(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "STATUS", "VALUE"])
                .add_row(vec![
                    response.service.to_string(),
                    response.status.to_string(),
                    response_value(response),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "{} {} {}",
                response.service,
                response.status,
                response_value(response)
            );
            for ctx in &response.contexts {
                println!(
                    "  {}:{} level={} status={} {}",
                    ctx.apid,
                    ctx.ctid,
                    ctx.log_level.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
                    ctx.trace_status.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
                    ctx.description
                );
            }
        }
    }
}

pub fn status_name(status: u8) -> &'static str {
    match status {
        service::status::OK => "ok",
        service::status::NOT_SUPPORTED => "not_supported",
        service::status::ERROR => "error",
        service::status::NO_MATCHING_CONTEXT => "no_matching_context",
        3..=7 => "ok",
        _ => "unknown",
    }
}

fn response_value(response: &ResponseOutput) -> String {
    match (&response.text, response.value) {
        (Some(text), _) => text.clone(),
        (None, Some(value)) => value.to_string(),
        (None, None) => String::new(),
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn message_kind(message: &Message) -> &'static str {
    let Some(extended) = message.extended else {
        return "plain";
    };
    match (extended.message_type(), extended.subtype()) {
        (msin::TYPE_LOG, _) => "log",
        (msin::TYPE_APP_TRACE, _) => "app_trace",
        (msin::TYPE_NW_TRACE, _) => "nw_trace",
        (msin::TYPE_CONTROL, msin::CONTROL_REQUEST) => "request",
        (msin::TYPE_CONTROL, msin::CONTROL_RESPONSE) => "response",
        (msin::TYPE_CONTROL, msin::CONTROL_TIME) => "time",
        _ => "unknown",
    }
}

/// Uptime ticks (0.1 ms) as seconds.
fn format_uptime(ticks: u32) -> String {
    format!("{}.{:04}", ticks / 10_000, ticks % 10_000)
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.trim_end_matches('\0').to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn hex(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len() * 3);
    for (i, byte) in payload.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dltrelay_frame::Id4;

    #[test]
    fn log_messages_show_text_payloads() {
        let message = Message::log(Id4::new("APP"), Id4::new("CTX"), 7, &b"hello"[..]);
        let out = MessageOutput::new(&message);
        assert_eq!(out.kind, "log");
        assert_eq!(out.apid, "APP");
        assert_eq!(out.payload, "hello");
        assert_eq!(out.service, None);
    }

    #[test]
    fn control_messages_name_their_service() {
        let message = Message::control(
            Id4::new("ECU1"),
            12_345,
            msin::RESPONSE,
            Id4::new("DA1"),
            Id4::new("DC1"),
            service::encode_connection_info(service::CONNECTION_CONNECTED),
        );
        let out = MessageOutput::new(&message);
        assert_eq!(out.kind, "response");
        assert_eq!(out.service, Some("connection_info"));
        assert_eq!(out.ecu, "ECU1");
        assert!(out.payload.starts_with("02 0f 00 00 00"));
    }

    #[test]
    fn uptime_is_printed_in_seconds() {
        assert_eq!(format_uptime(12_345), "1.2345");
        assert_eq!(format_uptime(5), "0.0005");
    }

    #[test]
    fn log_info_rows_follow_options() {
        let applications = vec![LogInfoApplication {
            apid: Id4::new("APP"),
            description: String::new(),
            contexts: vec![dltrelay_frame::service::LogInfoContext {
                ctid: Id4::new("CTX"),
                log_level: 4,
                trace_status: 0,
                description: String::new(),
            }],
        }];
        let rows = contexts_from_log_info(4, &applications);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].log_level, Some(4));
        assert_eq!(rows[0].trace_status, None);
    }
}
