mod fixtures;

use fixtures::*;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs::{self, File};
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

fn etw_format() -> Command {
    Command::new(assert_cmd::cargo_bin!("etw_format"))
}

#[test]
fn it_formats_messages_by_default() {
    let sample = service_events_bundle();

    let mut cmd = etw_format();
    cmd.arg(sample.to_str().unwrap());

    cmd.assert()
        .success()
        .stdout(include_str!("../samples/service_events_messages.txt"))
        .stderr(predicate::str::contains("failed to format record 2"));
}

#[test]
fn it_formats_json_without_meta() {
    let sample = service_events_bundle();

    let mut cmd = etw_format();
    cmd.args(["-o", "json", "--meta", "none", sample.to_str().unwrap()]);

    cmd.assert()
        .success()
        .stdout(include_str!("../samples/service_events_json.txt"));
}

#[test]
fn it_formats_prefixes() {
    let sample = service_events_bundle();

    let mut cmd = etw_format();
    cmd.args(["-o", "prefix", "-t", "1", sample.to_str().unwrap()]);

    let output = cmd.output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "[1]0200.0010::2018-04-01T00:23:38.6676037Z [Contoso-Service] ",
            "[1]0200.0011::2018-04-01T00:23:38.6676037Z [Contoso-Service] ",
            "[1]0200.0012::2018-04-01T00:23:38.6676037Z [Contoso-Service] ",
        ]
    );
}

#[test]
fn it_stops_after_one_error_if_asked() {
    let sample = service_events_bundle();

    let mut cmd = etw_format();
    cmd.args(["--stop-after-one-error", sample.to_str().unwrap()]);

    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("State").not())
        .stderr(predicate::str::contains("failed to format record 2"));
}

#[test]
fn it_respects_directory_output() {
    let d = tempdir().unwrap();
    let f = d.as_ref().join("nested").join("test.out");

    let sample = service_events_bundle();

    let mut cmd = etw_format();
    cmd.args(["-f", &f.to_string_lossy(), sample.to_str().unwrap()]);

    assert!(
        cmd.output().unwrap().stdout.is_empty(),
        "Expected output to be printed to file, but was printed to stdout"
    );

    let written = fs::read_to_string(&f).unwrap();
    assert_eq!(
        written,
        include_str!("../samples/service_events_messages.txt")
    );
}

#[test]
fn test_it_refuses_to_overwrite_directory() {
    let d = tempdir().unwrap();

    let sample = service_events_bundle();
    let mut cmd = etw_format();
    cmd.args(["-f", &d.path().to_string_lossy(), sample.to_str().unwrap()]);

    cmd.assert().failure().code(1);
}

#[test]
fn test_it_overwrites_file_anyways_if_passed_flag() {
    let d = tempdir().unwrap();
    let f = d.as_ref().join("test.out");

    let mut file = File::create(&f).unwrap();
    file.write_all(b"I'm a file!").unwrap();

    let sample = service_events_bundle();
    let mut cmd = etw_format();
    cmd.args([
        "-f",
        &f.to_string_lossy(),
        "--no-confirm-overwrite",
        sample.to_str().unwrap(),
    ]);

    cmd.assert().success();

    let written = fs::read_to_string(&f).unwrap();
    assert!(
        written.starts_with("Service web started"),
        "Expected output to replace the existing file"
    );
}

#[test]
fn it_supports_stdin_input_with_dash() {
    let sample = service_events_bundle();

    let mut cmd_file = etw_format();
    cmd_file.args(["-o", "json", sample.to_str().unwrap()]);
    let out_file = cmd_file.output().unwrap();
    assert!(
        out_file.status.success(),
        "expected file-input run to succeed"
    );
    assert!(
        !out_file.stdout.is_empty(),
        "expected file-input run to produce output"
    );

    let stdin_file = File::open(&sample).unwrap();
    let mut cmd_stdin = etw_format();
    cmd_stdin.args(["-o", "json", "-"]);
    cmd_stdin.stdin(stdin_file);
    let out_stdin = cmd_stdin.output().unwrap();
    assert!(
        out_stdin.status.success(),
        "expected stdin-input run to succeed"
    );
    assert_eq!(
        out_stdin.stdout, out_file.stdout,
        "stdin and file input should produce identical output"
    );
}

#[test]
fn it_rejects_invalid_bundles() {
    let d = tempdir().unwrap();
    let f = d.as_ref().join("broken.json");
    fs::write(&f, "{ \"events\": [").unwrap();

    let mut cmd = etw_format();
    cmd.arg(f.to_str().unwrap());

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid event bundle"));
}

#[test]
fn it_rejects_out_of_range_bias() {
    let sample = service_events_bundle();

    let mut cmd = etw_format();
    cmd.args(["--bias", "2000", sample.to_str().unwrap()]);

    cmd.assert().failure();
}
