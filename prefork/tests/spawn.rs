//! End-to-end spawn tests: these fork real processes.

#![cfg(unix)]

use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serial_test::serial;
use tempfile::TempDir;

use prefork::{
    BasicEndpointFactory, BootError, Error, Spawner, SpawnerOptions, spawn_cold,
};

fn app_root() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    std::fs::write(dir.path().join("config/app.toml"), "[app]\n").unwrap();
    dir
}

fn ack_handler(mut stream: UnixStream) {
    use std::io::Write;
    let _ = stream.write_all(b"ok\n");
}

fn endpoints() -> BasicEndpointFactory {
    BasicEndpointFactory::new(ack_handler)
}

fn ok_boot() -> Result<(), BootError> {
    Ok(())
}

fn config_fault_boot() -> Result<(), BootError> {
    Err(BootError::fault("ConfigError", "missing config"))
}

fn exiting_boot() -> Result<(), BootError> {
    Err(BootError::exit(3))
}

fn load_fault_boot() -> Result<(), BootError> {
    Err(BootError::fault("LoadError", "cannot load application"))
}

fn process_exists(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn wait_for_death(pid: i32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_exists(pid) {
        assert!(Instant::now() < deadline, "pid {pid} still alive");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn assert_no_children() {
    let leftover = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG));
    assert!(
        matches!(leftover, Err(Errno::ECHILD)),
        "unreaped child: {leftover:?}"
    );
}

#[test]
#[serial]
fn cold_spawn_returns_live_distinct_worker() {
    let root = app_root();
    let options = SpawnerOptions::new(root.path()).environment("test");

    let worker = spawn_cold(options, ok_boot, endpoints()).unwrap();
    assert_ne!(worker.pid(), std::process::id() as i32);
    assert!(process_exists(worker.pid()));
    assert!(worker.is_alive());

    kill(Pid::from_raw(worker.pid()), Signal::SIGTERM).unwrap();
    worker.wait_until_exit().unwrap();
    assert!(!worker.is_alive());
    assert_no_children();
}

#[test]
#[serial]
fn worker_shuts_down_when_owner_pipe_dropped() {
    let root = app_root();
    let worker = spawn_cold(SpawnerOptions::new(root.path()), ok_boot, endpoints()).unwrap();
    let pid = worker.pid();

    drop(worker);
    wait_for_death(pid);
    assert_no_children();
}

#[test]
#[serial]
fn owner_pipe_reads_eof_on_worker_death() {
    use std::io::Read;

    let root = app_root();
    let worker = spawn_cold(SpawnerOptions::new(root.path()), ok_boot, endpoints()).unwrap();
    let pid = worker.pid();

    let pipe = worker.into_owner_pipe();
    kill(Pid::from_raw(pid), Signal::SIGUSR1).unwrap();

    // The worker never writes; the read blocks until its death closes the
    // write end.
    let mut read_end = std::fs::File::from(pipe);
    let mut buf = Vec::new();
    read_end.read_to_end(&mut buf).unwrap();
    assert!(buf.is_empty());
    wait_for_death(pid);
    assert_no_children();
}

#[test]
#[serial]
fn cold_spawn_boot_fault_carries_class_and_message() {
    let root = app_root();
    let err = spawn_cold(
        SpawnerOptions::new(root.path()),
        config_fault_boot,
        endpoints(),
    )
    .unwrap_err();

    let text = err.to_string();
    assert!(matches!(err, Error::Boot { .. }), "got {err:?}");
    assert!(text.contains("ConfigError"));
    assert!(text.contains("missing config"));
    assert_no_children();
}

#[test]
#[serial]
fn cold_spawn_deliberate_exit_is_reported() {
    let root = app_root();
    let err = spawn_cold(
        SpawnerOptions::new(root.path()),
        exiting_boot,
        endpoints(),
    )
    .unwrap_err();

    assert!(matches!(err, Error::BootExited { .. }), "got {err:?}");
    assert!(err.to_string().contains("exited during startup"));
    assert_no_children();
}

#[test]
fn missing_root_fails_before_any_fork() {
    let options = SpawnerOptions::new("/prefork-no-such-root");
    let err = spawn_cold(options.clone(), ok_boot, endpoints()).unwrap_err();
    assert!(matches!(err, Error::InvalidAppRoot { .. }));

    let err = Spawner::start(options, ok_boot, endpoints()).unwrap_err();
    assert!(matches!(err, Error::InvalidAppRoot { .. }));
}

#[test]
#[serial]
fn warm_spawn_produces_independent_workers() {
    let root = app_root();
    let options = SpawnerOptions::new(root.path()).environment("test");
    let mut spawner = Spawner::start(options, ok_boot, endpoints()).unwrap();

    let first = spawner.spawn().unwrap();
    let second = spawner.spawn().unwrap();

    let own_pid = std::process::id() as i32;
    assert_ne!(first.pid(), second.pid());
    for worker in [&first, &second] {
        assert_ne!(worker.pid(), own_pid);
        assert_ne!(worker.pid(), spawner.preloader_pid());
        assert!(worker.is_alive());
    }

    #[cfg(target_os = "linux")]
    {
        assert!(first.uses_abstract_namespace());
        assert_eq!(connect_and_read(first.endpoint_name()), b"ok\n");
    }

    for worker in [first, second] {
        kill(Pid::from_raw(worker.pid()), Signal::SIGTERM).unwrap();
        worker.wait_until_exit().unwrap();
    }
    spawner.stop().unwrap();
    assert_no_children();
}

#[test]
#[serial]
fn boot_failure_during_start_aborts_startup() {
    let root = app_root();
    let err = Spawner::start(
        SpawnerOptions::new(root.path()),
        load_fault_boot,
        endpoints(),
    )
    .unwrap_err();

    assert!(err.to_string().contains("LoadError"));
    assert_no_children();
}

#[test]
#[serial]
fn killed_preloader_makes_spawn_unavailable() {
    let root = app_root();
    let mut spawner =
        Spawner::start(SpawnerOptions::new(root.path()), ok_boot, endpoints()).unwrap();

    let preloader = Pid::from_raw(spawner.preloader_pid());
    kill(preloader, Signal::SIGKILL).unwrap();
    // Reap it so the channel EOF below is deterministic.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match waitpid(preloader, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                assert!(Instant::now() < deadline, "preloader survived SIGKILL");
                std::thread::sleep(Duration::from_millis(10));
            }
            _ => break,
        }
    }

    let err = spawner.spawn().unwrap_err();
    assert!(matches!(err, Error::SpawnerUnavailable { .. }), "got {err:?}");
}

#[cfg(target_os = "linux")]
fn connect_and_read(name: &str) -> Vec<u8> {
    use std::io::Read;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .unwrap();
    let addr = UnixAddr::new_abstract(name.as_bytes()).unwrap();
    connect(fd.as_raw_fd(), &addr).unwrap();

    let mut stream = UnixStream::from(fd);
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    buf
}
