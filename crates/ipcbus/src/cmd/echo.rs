use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipcbus_node::Delivery;
use ipcbus_transport::{StreamListener, StreamTransport, Transport, TransportError};
use ipcbus_wire::{fragment_payload, MsgType, Segment};

use crate::cmd::EchoArgs;
use crate::collect::ChainCollector;
use crate::exit::{transport_error, wire_error, CliError, CliResult, SUCCESS};
use crate::output::OutputFormat;

const RECV_TICK: Duration = Duration::from_millis(100);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let listener =
        StreamListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        let sock = match listener.accept() {
            Ok(sock) => sock,
            Err(err) => return Err(transport_error("accept failed", err)),
        };
        let transport = StreamTransport::over(Arc::new(sock));
        let mut collector = ChainCollector::new();
        let mut next_id: u32 = 1;

        while running.load(Ordering::SeqCst) {
            let seg = match transport.recv(RECV_TICK) {
                Ok(Some(seg)) => seg,
                Ok(None) => continue,
                Err(TransportError::Closed) => break,
                Err(err) => return Err(transport_error("receive failed", err)),
            };

            let Some(chain) = collector.submit(seg) else {
                continue;
            };
            let Some(delivery) = Delivery::from_chain(&chain) else {
                continue;
            };
            if delivery.msg_type() == MsgType::Control {
                tracing::debug!(src = delivery.src(), "ignoring control message");
                continue;
            }

            tracing::info!(
                src = delivery.src(),
                msg_id = delivery.msg_id(),
                size = delivery.payload().len(),
                "echoing message"
            );

            next_id = reply(&transport, &delivery, next_id)?;
        }
    }

    Ok(SUCCESS)
}

/// Send the delivery's payload back to its sender, correlated to the
/// original message ID. Returns the next unused message ID.
fn reply(transport: &StreamTransport, delivery: &Delivery, next_id: u32) -> CliResult<u32> {
    let mut template = Segment::new();
    template.set_src(delivery.dst());
    template.set_dst(delivery.src());
    template.set_context(delivery.msg_id());
    template.set_msg_type(delivery.msg_type());
    template.set_priority(delivery.priority());

    let chain = fragment_payload(&template, delivery.payload().as_ref())
        .map_err(|err| wire_error("echo reply failed", err))?;
    for mut seg in chain {
        seg.set_msg_id(next_id);
        transport
            .send(seg, SEND_TIMEOUT)
            .map_err(|err| transport_error("echo send failed", err))?;
    }

    // Message IDs stay non-zero across wrap.
    Ok(next_id.checked_add(1).unwrap_or(1))
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
