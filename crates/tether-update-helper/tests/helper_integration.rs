use std::path::Path;
use std::process::Command;

fn helper() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tether-update-helper"))
}

#[test]
fn missing_arguments_exit_non_zero() {
    let output = helper().output().expect("helper should start");

    assert!(!output.status.success());
    assert!(!output.stderr.is_empty());
}

#[test]
fn missing_update_fails_without_touching_the_launcher() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let old = temp.path().join("tether");
    std::fs::write(&old, b"v1").expect("old build written");

    let output = helper()
        .arg(&old)
        .arg(temp.path().join("absent"))
        .output()
        .expect("helper should start");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("new executable not found"), "stderr: {stderr}");
    assert_eq!(std::fs::read(&old).expect("old build kept"), b"v1");
    assert!(!temp.path().join("tether.old").exists());
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("script written");
}

#[cfg(unix)]
#[test]
fn swaps_build_and_relaunches_it() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let old = temp.path().join("tether");
    let new = temp.path().join("tether-update-2.0.0");
    let marker = temp.path().join("relaunched");
    write_script(&old, "exit 0");
    write_script(&new, &format!("echo v2 > '{}'", marker.display()));

    let output = helper()
        .arg(&old)
        .arg(&new)
        .output()
        .expect("helper should start");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!new.exists());
    assert!(temp.path().join("tether.old").is_file());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !marker.exists() {
        assert!(
            std::time::Instant::now() < deadline,
            "relaunched build never ran"
        );
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}
