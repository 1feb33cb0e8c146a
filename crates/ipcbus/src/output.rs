use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use ipcbus_node::Delivery;
use ipcbus_wire::control::control_name;
use ipcbus_wire::MsgType;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema_id: &'a str,
    src: u32,
    dst: u32,
    msg_id: u32,
    context: u32,
    msg_type: &'a str,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_message(delivery: &Delivery, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                schema_id: "https://schemas.3leaps.dev/ipcbus/cli/v1/message-received.schema.json",
                src: delivery.src(),
                dst: delivery.dst(),
                msg_id: delivery.msg_id(),
                context: delivery.context(),
                msg_type: type_name(delivery.msg_type()),
                payload_size: delivery.payload().len(),
                payload: payload_preview(delivery.payload().as_ref()),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Pretty => {
            let kind = match delivery.msg_type() {
                MsgType::Control => control_name(delivery.ctl_code()).to_string(),
                other => type_name(other).to_string(),
            };
            println!(
                "src={} msg_id={} context={} type={} size={} payload={}",
                delivery.src(),
                delivery.msg_id(),
                delivery.context(),
                kind,
                delivery.payload().len(),
                payload_preview(delivery.payload().as_ref())
            );
        }
        OutputFormat::Raw => {
            print_raw(delivery.payload().as_ref());
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn type_name(msg_type: MsgType) -> &'static str {
    match msg_type {
        MsgType::Raw => "RAW",
        MsgType::Value => "VALUE",
        MsgType::Control => "CONTROL",
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
