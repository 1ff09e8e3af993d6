use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Read;
use std::os::unix::net::UnixListener;
use std::thread;

fn fave_cli() -> Command {
    Command::cargo_bin("fave-cli").unwrap()
}

#[test]
fn test_help_lists_commands() {
    fave_cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("link"))
        .stdout(predicate::str::contains("stop"));
}

#[test]
fn test_send_rejects_invalid_message() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bad.json");
    std::fs::write(&file, r#"{"type": "no_such_model"}"#).unwrap();

    fave_cli()
        .args(["--retries", "1", "send"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("message 0 is invalid"));
}

#[test]
fn test_unreachable_socket_fails() {
    let dir = tempfile::tempdir().unwrap();

    fave_cli()
        .arg("--socket")
        .arg(dir.path().join("missing.socket"))
        .args(["--retries", "1", "stop"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not connect"));
}

#[test]
fn test_show_summarizes_dump() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("fave.json"),
        r#"{
            "mapping": {"length": 32, "ipv4_dst": 0},
            "id_to_table": {"1": "s1", "2": "s2"},
            "id_to_port": {"65537": "s1.1"},
            "id_to_rule": {},
            "id_to_generator": {},
            "id_to_probe": {},
            "links": [[65537, 131073]],
            "slices": {}
        }"#,
    )
    .unwrap();

    fave_cli()
        .arg("show")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Header length:  32 bits"))
        .stdout(predicate::str::contains("Tables:         2"))
        .stdout(predicate::str::contains("Links:          1"));
}

#[test]
fn test_stop_sends_framed_message() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agg.socket");
    let listener = UnixListener::bind(&socket).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    });

    fave_cli()
        .arg("--socket")
        .arg(&socket)
        .arg("stop")
        .assert()
        .success();

    let received = server.join().unwrap();
    let payload = br#"{"type":"stop"}"#;
    assert_eq!(&received[..4], &(payload.len() as u32).to_be_bytes());
    assert_eq!(&received[4..], payload);
}
