use std::process::Command;
use std::time::{Duration, Instant};

const WATCHDOG_EXIT_CODE: i32 = 70;

fn hold_lock(path: &std::path::Path, ceiling_ms: u64, hold_ms: u64) -> std::process::ExitStatus {
    Command::new(env!("CARGO_BIN_EXE_arb_runner"))
        .arg("hold-lock")
        .arg("--path")
        .arg(path)
        .arg("--ceiling-ms")
        .arg(ceiling_ms.to_string())
        .arg("--hold-ms")
        .arg(hold_ms.to_string())
        .env("RUST_LOG", "warn")
        .status()
        .expect("spawn arb_runner")
}

#[test]
fn holder_past_ceiling_is_terminated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let started = Instant::now();
    let status = hold_lock(&dir.path().join("arbwatch.lock"), 200, 60_000);
    assert!(!status.success());
    assert_eq!(status.code(), Some(WATCHDOG_EXIT_CODE));
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
fn holder_within_ceiling_exits_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let status = hold_lock(&dir.path().join("arbwatch.lock"), 60_000, 50);
    assert!(status.success());
}
