use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipcbus_node::Delivery;
use ipcbus_transport::{connect, StreamTransport, Transport};
use ipcbus_wire::{fragment_payload, MsgType, Segment};

use crate::cmd::SendArgs;
use crate::collect::ChainCollector;
use crate::exit::{transport_error, wire_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, OutputFormat};

const RECV_TICK: Duration = Duration::from_millis(100);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let sock = connect(&args.path).map_err(|err| transport_error("connect failed", err))?;
    let transport = StreamTransport::over(Arc::new(sock));

    let mut template = Segment::new();
    template.set_src(args.source);
    template.set_dst(args.dest);
    template.set_priority(args.priority.into());
    if args.json.is_some() {
        template.set_msg_type(MsgType::Value);
    }

    let chain = fragment_payload(&template, &payload)
        .map_err(|err| wire_error("payload rejected", err))?;
    let msg_id = 1u32;
    tracing::debug!(
        dst = args.dest,
        msg_id,
        fragments = chain.len(),
        size = payload.len(),
        "sending message"
    );
    for mut seg in chain {
        seg.set_msg_id(msg_id);
        transport
            .send(seg, SEND_TIMEOUT)
            .map_err(|err| transport_error("send failed", err))?;
    }

    if args.wait {
        let delivery = await_response(&transport, msg_id, wait_timeout)?;
        print_message(&delivery, format);
    }

    Ok(SUCCESS)
}

/// Receive until a message correlated to `msg_id` arrives; anything else in
/// the window is logged and dropped.
fn await_response(
    transport: &StreamTransport,
    msg_id: u32,
    timeout: Duration,
) -> CliResult<Delivery> {
    let deadline = Instant::now() + timeout;
    let mut collector = ChainCollector::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CliError::new(
                TIMEOUT,
                format!("no response within {}ms", timeout.as_millis()),
            ));
        }

        let seg = match transport.recv(remaining.min(RECV_TICK)) {
            Ok(Some(seg)) => seg,
            Ok(None) => continue,
            Err(err) => return Err(transport_error("receive failed", err)),
        };

        let Some(chain) = collector.submit(seg) else {
            continue;
        };
        let Some(delivery) = Delivery::from_chain(&chain) else {
            continue;
        };
        if delivery.context() == msg_id {
            return Ok(delivery);
        }
        tracing::debug!(
            src = delivery.src(),
            context = delivery.context(),
            "dropping uncorrelated message"
        );
    }
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}
