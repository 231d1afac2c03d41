//! Daemon behavior: signal-driven reinit and stop escalation.
//!
//! These tests touch process-wide signal state and real child
//! processes, so they serialize on one lock.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use sdpc_core::client::Client;
use sdpc_core::config::ClientConfig;
use sdpc_core::daemon::{pidfile, signals, LockOutcome};
use sdpc_core::error::Error;
use sdpc_test_utils::MockChannel;
use tempfile::TempDir;

static PROCESS_STATE_LOCK: Mutex<()> = Mutex::new(());

fn write_config(dir: &TempDir, keep_alive_secs: u64) -> (PathBuf, PathBuf) {
    let config_path = dir.path().join("sdpc.conf");
    let fwknoprc_path = dir.path().join("fwknoprc");
    fs::write(
        &config_path,
        format!(
            "CTRL_ADDR controller.test\n\
             REMAIN_CONNECTED 1\n\
             KEY_FILE /tmp/k\n\
             CERT_FILE /tmp/c\n\
             KEEP_ALIVE_INTERVAL {keep_alive_secs}\n"
        ),
    )
    .unwrap();
    fs::write(&fwknoprc_path, "[controller]\nKEY_BASE64 a\nHMAC_KEY_BASE64 b\n").unwrap();
    (config_path, fwknoprc_path)
}

/// SIGHUP makes the running loop re-read its config in place: the new
/// interval is adopted, the transport is rebuilt through the same slot,
/// and the PID-file lock descriptor never changes hands.
#[test]
fn sighup_reinit_rereads_config_and_keeps_lock() {
    let _guard = PROCESS_STATE_LOCK.lock().unwrap();

    let dir = TempDir::new().unwrap();
    let (config_path, fwknoprc_path) = write_config(&dir, 60);
    let pid_path = dir.path().join("sdpc.pid");

    let config = ClientConfig::load(&config_path, &fwknoprc_path).unwrap();
    let lock = match pidfile::acquire(&pid_path).unwrap() {
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::HeldBy(pid) => panic!("unexpected holder {pid}"),
    };
    let fd_before = lock.raw_fd();

    let mut client = Client::new(&config, MockChannel::new().answer_keep_alives());
    client.policy_mut().tick = Duration::from_millis(5);
    client.attach_pid_lock(lock);

    signals::install().unwrap();

    let worker = thread::spawn(move || {
        let result = client.run();
        (result, client)
    });

    // Let the loop settle, swap the config on disk, then ask for the
    // in-place restart.
    thread::sleep(Duration::from_millis(50));
    fs::write(
        &config_path,
        "CTRL_ADDR controller.test\n\
         REMAIN_CONNECTED 1\n\
         KEY_FILE /tmp/k\n\
         CERT_FILE /tmp/c\n\
         KEEP_ALIVE_INTERVAL 5\n",
    )
    .unwrap();
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).unwrap();

    thread::sleep(Duration::from_millis(100));
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

    let (result, client) = worker.join().unwrap();
    assert!(matches!(result, Err(Error::GotExitSig)));

    // Config re-read on the fly.
    assert_eq!(client.policy().keep_alive_interval, Duration::from_secs(5));
    // The transport was reconfigured in place and reconnected after.
    assert_eq!(client.channel().reconfigure_count(), 1);
    assert!(client.channel().connect_count() >= 2);

    // Same lock, same descriptor, still held.
    let lock = client.pid_lock().expect("lock survived reinit");
    assert_eq!(lock.raw_fd(), fd_before);
    match pidfile::acquire(&pid_path).unwrap() {
        LockOutcome::HeldBy(pid) => assert_eq!(pid, std::process::id() as i32),
        LockOutcome::Acquired(_) => panic!("lock was dropped during reinit"),
    }
}

/// SIGINT ends the loop through the sticky-flag path.
#[test]
fn sigint_exits_the_loop() {
    let _guard = PROCESS_STATE_LOCK.lock().unwrap();

    let dir = TempDir::new().unwrap();
    let (config_path, fwknoprc_path) = write_config(&dir, 60);
    let config = ClientConfig::load(&config_path, &fwknoprc_path).unwrap();

    let mut client = Client::new(&config, MockChannel::new().answer_keep_alives());
    client.policy_mut().tick = Duration::from_millis(5);

    signals::install().unwrap();

    let worker = thread::spawn(move || client.run());

    thread::sleep(Duration::from_millis(30));
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();

    let result = worker.join().unwrap();
    assert!(matches!(result, Err(Error::GotExitSig)));
}

/// Stop escalation: a target that ignores TERM is killed within the
/// grace windows.
#[test]
fn stop_escalates_to_kill_for_term_trapping_target() {
    let _guard = PROCESS_STATE_LOCK.lock().unwrap();

    let dir = TempDir::new().unwrap();
    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg("trap '' TERM; sleep 30")
        .spawn()
        .unwrap();
    let pid = child.id() as i32;

    // Give the shell a moment to install its trap.
    thread::sleep(Duration::from_millis(100));

    let pid_path = dir.path().join("sdpc.pid");
    fs::write(&pid_path, format!("{pid}\n")).unwrap();
    fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600)).unwrap();

    // Reap concurrently; the signal handler may beat us to it.
    let reaper = thread::spawn(move || {
        let _ = child.wait();
    });

    let start = std::time::Instant::now();
    sdpc_core::daemon::stop(&pid_path).unwrap();
    let elapsed = start.elapsed();

    // TERM grace plus a little KILL latency, nowhere near the sleep 30.
    assert!(elapsed < Duration::from_secs(5), "stop took {elapsed:?}");
    reaper.join().unwrap();
}
