#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use ipcbus_transport::connect;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/ipcbus-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_connect(path: &Path, timeout: Duration) {
    let start = Instant::now();
    loop {
        if connect(path).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("connect timeout");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn version_reports_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn send_against_echo_server_prints_correlated_reply() {
    let dir = unique_temp_dir("echo");
    let sock_path = dir.join("echo.sock");

    let mut child = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("--log-level")
        .arg("error")
        .arg("echo")
        .arg(&sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("echo command should start");

    wait_for_connect(&sock_path, Duration::from_secs(3));

    let output = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("send")
        .arg(&sock_path)
        .arg("--data")
        .arg("hello over the wire")
        .arg("--wait")
        .output()
        .expect("send should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("message-received.schema.json"));
    assert!(stdout.contains("hello over the wire"));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn listen_prints_messages_and_stops_at_count() {
    let dir = unique_temp_dir("listen");
    let sock_path = dir.join("listen.sock");

    let child = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("listen")
        .arg(&sock_path)
        .arg("--count")
        .arg("1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("listen command should start");

    wait_for_connect(&sock_path, Duration::from_secs(3));

    let sent = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("--log-level")
        .arg("error")
        .arg("send")
        .arg(&sock_path)
        .arg("--data")
        .arg("from-test")
        .output()
        .expect("send should run");
    assert!(sent.status.success());

    let output = child.wait_with_output().expect("listen should exit");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("message-received.schema.json"));
    assert!(stdout.contains("from-test"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wait_against_silent_listener_returns_124() {
    let dir = unique_temp_dir("silent");
    let sock_path = dir.join("listen.sock");

    let mut child = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("--log-level")
        .arg("error")
        .arg("listen")
        .arg(&sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("listen command should start");

    wait_for_connect(&sock_path, Duration::from_secs(3));

    let output = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("send")
        .arg(&sock_path)
        .arg("--data")
        .arg("nobody answers")
        .arg("--wait")
        .arg("--wait-timeout")
        .arg("1s")
        .output()
        .expect("send should run");

    assert_eq!(output.status.code(), Some(124));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn doctor_passes_on_clean_env() {
    let output = Command::new(env!("CARGO_BIN_EXE_ipcbus"))
        .arg("--format")
        .arg("json")
        .arg("doctor")
        .output()
        .expect("doctor should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("doctor-report.schema.json"));
    assert!(stdout.contains("\"overall\":\"pass\""));
}
