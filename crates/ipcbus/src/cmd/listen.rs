use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipcbus_node::Delivery;
use ipcbus_transport::{StreamListener, StreamTransport, Transport, TransportError};

use crate::cmd::ListenArgs;
use crate::collect::ChainCollector;
use crate::exit::{transport_error, CliError, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

const RECV_TICK: Duration = Duration::from_millis(100);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener =
        StreamListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let sock = match listener.accept() {
            Ok(sock) => sock,
            Err(err) => return Err(transport_error("accept failed", err)),
        };
        let transport = StreamTransport::over(Arc::new(sock));
        let mut collector = ChainCollector::new();

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

            print_message(&delivery, format);
            printed = printed.saturating_add(1);

            if let Some(count) = args.count {
                if printed >= count {
                    return Ok(SUCCESS);
                }
            }
        }
    }

    Ok(SUCCESS)
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
