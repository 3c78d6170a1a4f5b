//! Integration tests for the groupseg binary: config file, env overrides, CLI flags, and runs.

use std::process::Command;

use groupseg::SegmentGroup;

/// Run groupseg in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_groupseg(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_groupseg");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run groupseg");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

#[test]
fn validate_config_no_config_prints_defaults() {
    let (ok, stdout, stderr) = run_groupseg(&["--validate-config", "--no-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("error_bound=0"), "stdout: {}", stdout);
    assert!(stdout.contains("length_bound=50"), "stdout: {}", stdout);
    assert!(
        stdout.contains("model_types=pmc_mean,swing,gorilla"),
        "stdout: {}",
        stdout
    );
    assert!(
        stdout.contains("fallback_model_type=uncompressed"),
        "stdout: {}",
        stdout
    );
}

#[test]
fn validate_config_env_overridden_by_cli() {
    let (ok, stdout, _) = run_groupseg(
        &["--validate-config", "--no-config", "--error-bound", "2.5"],
        &[("GROUPSEG_ERROR_BOUND", "7")],
    );
    assert!(ok);
    assert!(stdout.contains("error_bound=2.5"), "CLI should win: {}", stdout);
}

#[test]
fn validate_config_env_override_with_no_config() {
    let (ok, stdout, _) = run_groupseg(
        &["--validate-config", "--no-config"],
        &[("GROUPSEG_MAXIMUM_LATENCY", "12")],
    );
    assert!(ok);
    assert!(stdout.contains("maximum_latency=12"), "stdout: {}", stdout);
}

#[test]
fn config_file_is_layered_under_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("groupseg.toml");
    std::fs::write(
        &path,
        r#"
error_bound = 1.5
length_bound = 20
model_types = ["swing", "pmc_mean"]

[csv]
separator = ","
"#,
    )
    .expect("write config");

    let (ok, stdout, stderr) = run_groupseg(
        &["--validate-config", "--config", path.to_str().unwrap()],
        &[("GROUPSEG_LENGTH_BOUND", "30")],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("error_bound=1.5"), "stdout: {}", stdout);
    assert!(stdout.contains("length_bound=30"), "env should win: {}", stdout);
    assert!(stdout.contains("model_types=swing,pmc_mean"), "stdout: {}", stdout);
    assert!(stdout.contains("csv_separator=,"), "stdout: {}", stdout);
}

#[test]
fn invalid_model_type_in_config_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "model_types = [\"wavelet\"]\n").expect("write config");

    let (ok, _, stderr) = run_groupseg(&["--validate-config", "--config", path.to_str().unwrap()], &[]);
    assert!(!ok);
    assert!(stderr.contains("config error"), "stderr: {}", stderr);
}

#[test]
fn out_of_range_error_bound_fails() {
    let (ok, _, stderr) = run_groupseg(
        &["--validate-config", "--no-config", "--error-bound", "150"],
        &[],
    );
    assert!(!ok);
    assert!(stderr.contains("error bound"), "stderr: {}", stderr);
}

#[test]
fn missing_config_file_fails() {
    let (ok, _, stderr) = run_groupseg(
        &["--validate-config", "--config", "/definitely/not/here.toml"],
        &[],
    );
    assert!(!ok);
    assert!(stderr.contains("config file not found"), "stderr: {}", stderr);
}

#[test]
fn malformed_group_argument_fails() {
    let (ok, _, stderr) = run_groupseg(&["--no-config", "--group", "1-a.csv"], &[]);
    assert!(!ok);
    assert!(stderr.contains("invalid group"), "stderr: {}", stderr);
}

#[test]
fn compresses_csv_groups_and_writes_segments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = dir.path().join("a.csv");
    let b = dir.path().join("b.csv");
    std::fs::write(&a, "100;1.0\n200;1.0\n300;1.0\n").expect("write a");
    std::fs::write(&b, "100;1.0\n200;1.0\n300;1.0\n").expect("write b");
    let output = dir.path().join("segments.bin");
    let group = format!("4:1={},2={}", a.display(), b.display());

    let (ok, stdout, stderr) = run_groupseg(
        &[
            "--no-config",
            "--group",
            &group,
            "--output",
            output.to_str().unwrap(),
        ],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(
        stdout.contains("Segment: [gid: 4 | start: 100 | end: 300 | si: 100 | mtid: 2]"),
        "stdout: {}",
        stdout
    );
    assert!(stderr.contains("1 segments from 1 groups (0 failed)"), "stderr: {}", stderr);

    let bytes = std::fs::read(&output).expect("read output");
    let segments: Vec<SegmentGroup> = bincode::deserialize(&bytes).expect("decode output");
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].gid, 4);
}
