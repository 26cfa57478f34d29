//! End-to-end tests for the `autobone-cli` binary
//!
//! Every run is bounded by a deadline: a CLI that misses its session's
//! terminal event would otherwise block forever.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

const DEADLINE: Duration = Duration::from_secs(20);

fn cli(config: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_autobone-cli"));
    command.arg("--config").arg(config);
    command
}

fn write_config(dir: &Path) -> PathBuf {
    let config = json!({
        "recording": {
            "sample_count": 10,
            "sample_interval_ms": 1,
            "recordings_dir": dir.join("recordings"),
            "last_recording_path": dir.join("last.mrec"),
        },
        "optimizer": { "num_epochs": 3, "log_every_n_epochs": 0 },
        "skeleton": { "config_path": dir.join("skeleton.json") },
    });
    let path = dir.join("config.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

/// Run to completion, killing the process if it outlives the deadline.
fn run(mut command: Command) -> Output {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn autobone-cli");
    let deadline = Instant::now() + DEADLINE;
    loop {
        if child.try_wait().expect("poll autobone-cli").is_some() {
            return child.wait_with_output().expect("collect output");
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("autobone-cli did not exit within {:?}", DEADLINE);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn process_without_recordings_fails_fast_and_exits() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    // The session fails almost immediately; repeat to hit the window
    // between starting it and listening for its events.
    for _ in 0..10 {
        let mut command = cli(&config);
        command.args(["process", "--include-saved"]);
        let output = run(command);

        assert_eq!(output.status.code(), Some(2));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Process failed"), "stderr: {stderr}");
    }
}

#[test]
fn record_then_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let mut record = cli(&config);
    record.arg("record");
    let output = run(record);
    assert!(
        output.status.success(),
        "record exited with {:?}: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );

    let last = dir.path().join("last.mrec");
    assert!(last.exists());

    let mut inspect = cli(&config);
    inspect.arg("inspect").arg(&last);
    let output = run(inspect);
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).expect("inspect prints JSON");
    assert_eq!(summary["max_frame_count"], 10);
    assert_eq!(summary["trackers"].as_array().map(Vec::len), Some(7));
}

#[test]
fn calibrate_applies_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let mut calibrate = cli(&config);
    calibrate.args(["calibrate", "--samples", "30"]);
    let output = run(calibrate);
    assert!(
        output.status.success(),
        "calibrate exited with {:?}: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(dir.path().join("skeleton.json").exists());
}
