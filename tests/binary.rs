//! Integration tests for the `server` binary and the client library,
//! talking real TCP rather than mocking the stream.

use std::env;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::thread::sleep;
use std::time::Duration;

use serial_test::serial;

use nbd::client::Client;

fn exe_path(name: &str) -> PathBuf {
    let bin_dir = env::current_exe()
        .unwrap()
        .parent()
        .expect("test executable's directory")
        .parent()
        .expect("output directory")
        .to_path_buf();
    bin_dir.join(name)
}

fn cmd_stdout(out: Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

#[test]
fn test_server_help_flag() {
    let out = Command::new(exe_path("server"))
        .arg("--help")
        .output()
        .expect("failed to run server --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("Usage"));
}

const TEST_PORT: u16 = 14089;

fn spawn_test_server(extra_args: &[&str]) -> std::process::Child {
    let child = Command::new(exe_path("server"))
        .args(["--port", &TEST_PORT.to_string()])
        .args(extra_args)
        .arg("memory")
        .args(["--size", "1048576"])
        .spawn()
        .expect("failed to start server");
    sleep(Duration::from_millis(200));
    child
}

#[test]
#[serial]
fn test_read_write_roundtrip() {
    let mut server = spawn_test_server(&[]);
    let mut client = Client::connect("127.0.0.1", TEST_PORT).expect("client connect");

    assert_eq!(client.size(), 1048576);

    let data = vec![0xab; 4096];
    client.write(0, &data).expect("write");
    let read = client.read(0, 4096).expect("read");
    assert_eq!(read, data);

    client.flush().expect("flush");
    client.disconnect().expect("disconnect");
    server.kill().ok();
}

#[test]
#[serial]
fn test_trim_and_write_zeroes() {
    let mut server = spawn_test_server(&[]);
    let mut client = Client::connect("127.0.0.1", TEST_PORT).expect("client connect");

    client.write(0, &[7u8; 512]).expect("write");
    client.write_zeroes(0, 512).expect("write_zeroes");
    let read = client.read(0, 512).expect("read");
    assert_eq!(read, vec![0u8; 512]);

    client.trim(0, 512).expect("trim");
    client.disconnect().expect("disconnect");
    server.kill().ok();
}

#[test]
#[serial]
fn test_multiple_sequential_connections() {
    let mut server = spawn_test_server(&[]);

    for _ in 0..3 {
        let client = Client::connect("127.0.0.1", TEST_PORT).expect("client connect");
        assert_eq!(client.size(), 1048576);
        client.disconnect().expect("disconnect");
    }

    server.kill().ok();
}

#[test]
#[serial]
fn test_abrupt_disconnect_is_not_fatal() {
    let mut server = spawn_test_server(&[]);

    // Connect and drop without a clean NBD_CMD_DISC; the server should
    // treat the resulting read error as an ordinary disconnect and keep
    // accepting new connections.
    {
        let stream = TcpStream::connect(("127.0.0.1", TEST_PORT)).expect("tcp connect");
        drop(stream);
    }
    sleep(Duration::from_millis(100));

    let client = Client::connect("127.0.0.1", TEST_PORT).expect("client connect after drop");
    client.disconnect().expect("disconnect");

    server.kill().ok();
}
