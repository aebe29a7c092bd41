//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use claude_relay::config::RelayConfig;
use claude_relay::relay::{self, RelayHandle};

/// Relay configuration for tests: ephemeral port, fast polling backend.
pub fn test_config(root: &Path) -> RelayConfig {
    RelayConfig {
        watch_root: root.to_path_buf(),
        host: "127.0.0.1".to_string(),
        port: 0,
        poll_watcher: true,
        poll_interval: Duration::from_millis(100),
        ..RelayConfig::default()
    }
}

/// Start a relay over `root` on an ephemeral port.
pub async fn start_relay(root: &Path) -> RelayHandle {
    relay::spawn(test_config(root))
        .await
        .expect("relay failed to start")
}

/// Start a relay with a customized configuration.
pub async fn start_relay_with(
    root: &Path,
    customize: impl FnOnce(&mut RelayConfig),
) -> RelayHandle {
    let mut config = test_config(root);
    customize(&mut config);
    relay::spawn(config).await.expect("relay failed to start")
}

/// Render one well-formed session log line with the current timestamp.
pub fn log_line(session: &str, role: &str, content: &str) -> String {
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    format!(
        r#"{{"sessionId":"{session}","type":"{role}","message":{{"role":"{role}","content":"{content}"}},"timestamp":"{timestamp}","cwd":"/p"}}"#
    )
}

/// Append one line (plus newline) to a log file, creating it if needed.
pub fn append_line(path: &Path, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log for append");
    writeln!(file, "{line}").expect("append log line");
}

/// Pair a device over HTTP and return its credential key.
pub async fn pair_device(base_url: &str, device_id: &str) -> String {
    let client = reqwest::Client::new();
    let qr: serde_json::Value = client
        .post(format!("{base_url}/api/auth/qr"))
        .send()
        .await
        .expect("qr request")
        .json()
        .await
        .expect("qr body");
    let token = qr["token"].as_str().expect("token").to_string();

    let redeemed: serde_json::Value = client
        .post(format!("{base_url}/api/auth/mobile"))
        .json(&serde_json::json!({ "token": token, "device_id": device_id }))
        .send()
        .await
        .expect("redeem request")
        .json()
        .await
        .expect("redeem body");
    redeemed["key"].as_str().expect("key").to_string()
}
