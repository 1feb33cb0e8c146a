use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use ipcbus_node::{Delivery, Node, NodeConfig, Router, RouterConfig};
use ipcbus_wire::{assemble_payload, fragment_payload, Segment};

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        platform_transport_check(),
        temp_socket_check(),
        segment_chain_check(),
        relay_exchange_check(),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: "https://schemas.3leaps.dev/ipcbus/cli/v1/doctor-report.schema.json",
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Pretty => {
            println!("ipcbus doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<20} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
    }
}

fn platform_transport_check() -> CheckResult {
    #[cfg(unix)]
    {
        CheckResult {
            name: "platform_transport".to_string(),
            status: CheckStatus::Pass,
            detail: "Unix domain sockets available".to_string(),
        }
    }

    #[cfg(not(unix))]
    {
        CheckResult {
            name: "platform_transport".to_string(),
            status: CheckStatus::Fail,
            detail: "stream transport requires Unix domain sockets".to_string(),
        }
    }
}

fn temp_socket_check() -> CheckResult {
    #[cfg(unix)]
    {
        use ipcbus_transport::StreamListener;
        let dir = std::path::PathBuf::from(format!(
            "/tmp/ipcbus-doctor-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        let _ = std::fs::create_dir_all(&dir);
        let sock = dir.join("doctor.sock");
        let result = StreamListener::bind(&sock);
        let _ = std::fs::remove_dir_all(&dir);

        match result {
            Ok(_) => CheckResult {
                name: "temp_socket".to_string(),
                status: CheckStatus::Pass,
                detail: "/tmp socket bind succeeded".to_string(),
            },
            Err(err) => CheckResult {
                name: "temp_socket".to_string(),
                status: CheckStatus::Fail,
                detail: format!("/tmp socket bind failed: {err}"),
            },
        }
    }

    #[cfg(not(unix))]
    {
        CheckResult {
            name: "temp_socket".to_string(),
            status: CheckStatus::Fail,
            detail: "socket bind check requires a Unix platform".to_string(),
        }
    }
}

/// Fragment a payload across the multipart boundary and reassemble it.
fn segment_chain_check() -> CheckResult {
    let payload = vec![0xA5u8; 3000];
    let mut template = Segment::new();
    template.set_src(1);
    template.set_dst(2);

    let chain = match fragment_payload(&template, &payload) {
        Ok(chain) => chain,
        Err(err) => {
            return CheckResult {
                name: "segment_chain".to_string(),
                status: CheckStatus::Fail,
                detail: format!("fragmentation failed: {err}"),
            }
        }
    };
    let reassembled = assemble_payload(&chain);

    if reassembled.as_ref() == payload.as_slice() {
        CheckResult {
            name: "segment_chain".to_string(),
            status: CheckStatus::Pass,
            detail: format!("3000 bytes fragmented into {} segments and rejoined", chain.len()),
        }
    } else {
        CheckResult {
            name: "segment_chain".to_string(),
            status: CheckStatus::Fail,
            detail: "reassembled payload does not match original".to_string(),
        }
    }
}

/// Stand up a router and two nodes in-process and run one correlated
/// request/response exchange through the relay.
fn relay_exchange_check() -> CheckResult {
    match run_relay_exchange() {
        Ok(elapsed) => CheckResult {
            name: "relay_exchange".to_string(),
            status: CheckStatus::Pass,
            detail: format!(
                "3000-byte request round-tripped through relay in {}ms",
                elapsed.as_millis()
            ),
        },
        Err(detail) => CheckResult {
            name: "relay_exchange".to_string(),
            status: CheckStatus::Fail,
            detail,
        },
    }
}

fn run_relay_exchange() -> Result<Duration, String> {
    let router = Router::new(RouterConfig::default()).map_err(|e| format!("router: {e}"))?;
    let (addr_a, ta) = router.attach("doctor-a").map_err(|e| format!("attach a: {e}"))?;
    let (addr_b, tb) = router.attach("doctor-b").map_err(|e| format!("attach b: {e}"))?;

    let a = Arc::new(Node::new(NodeConfig::new("doctor-a", addr_a), Arc::new(ta)));
    let b = Arc::new(Node::new(NodeConfig::new("doctor-b", addr_b), Arc::new(tb)));
    a.set_resolve_callback(router.resolve_callback());
    a.start().map_err(|e| format!("start a: {e}"))?;
    b.start().map_err(|e| format!("start b: {e}"))?;

    let responder = Arc::clone(&b);
    b.register_handler(
        0,
        Arc::new(move |delivery: &Delivery| {
            if let Err(err) = responder.respond(delivery, delivery.payload().as_ref()) {
                tracing::warn!(error = %err, "doctor responder failed");
            }
        }),
        1,
    );

    let dest = a
        .resolve("doctor-b")
        .map_err(|e| format!("resolve: {e}"))?;
    let payload = vec![0x3Cu8; 3000];
    let started = Instant::now();
    let reply = a
        .request(dest, &payload, Duration::from_secs(2))
        .map_err(|e| format!("request: {e}"))?;
    let elapsed = started.elapsed();

    if reply.payload().as_ref() != payload.as_slice() {
        return Err("response payload does not match request".to_string());
    }

    a.shutdown();
    b.shutdown();
    router.shutdown();
    Ok(elapsed)
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    if cfg!(unix) {
        features.push("unix-stream");
    }

    CheckResult {
        name: "compiled_features".to_string(),
        status: CheckStatus::Info,
        detail: features.join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let checks = vec![CheckResult {
            name: "x".to_string(),
            status: CheckStatus::Pass,
            detail: "ok".to_string(),
        }];
        let output = DoctorOutput {
            schema_id: "x",
            checks,
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
    }

    #[test]
    fn relay_exchange_round_trips() {
        let elapsed = run_relay_exchange().expect("exchange should succeed");
        assert!(elapsed < Duration::from_secs(2));
    }
}
