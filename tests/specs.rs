// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios for the backup scheduler engine.
//!
//! Each scenario drives the public scheduler API step by step against a
//! scripted node-agent sidecar on a loopback TCP port. The final scenario
//! exercises the whole daemon surface: control socket → listener →
//! scheduler → worker → history.

use std::path::{Path, PathBuf};
use std::time::Duration;

use packrat_core::{Clock, FinishedTask, NodeAddress, NodeName, SystemClock, TaskKey};
use packrat_daemon::listener::{ControlRequest, Listener};
use packrat_daemon::protocol::{wire, Reply, Request};
use packrat_daemon::{digest, worker, Scheduler, SchedulerConfig};
use packrat_storage::Store;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;

const POLL: Duration = Duration::from_millis(20);
const PAYLOAD: &[u8] = b"compressed snapshot archive";

// ----------------------------------------------------------------------
// Scripted sidecar
// ----------------------------------------------------------------------

#[derive(Clone, Copy)]
enum SidecarMode {
    /// Serve the full protocol with a fixed payload.
    Payload(&'static [u8]),
    /// Report the snapshot as unchanged.
    Same,
    /// Promise a payload, send a fragment, hang up.
    FailMidTransfer,
    /// Accept and never reply, pinning the worker.
    Stall,
}

async fn spawn_sidecar(mode: SidecarMode) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve(stream, mode));
        }
    });
    port
}

async fn serve(mut stream: TcpStream, mode: SidecarMode) {
    let mut buf = [0u8; 1024];
    // The snapshot request; scripted servers don't inspect it.
    let _ = stream.read(&mut buf).await;

    match mode {
        SidecarMode::Same => {
            let _ = stream.write_all(b"SAME").await;
        }
        SidecarMode::Payload(payload) => {
            let mut ok = [0u8; 2];
            let _ = stream
                .write_all(payload.len().to_string().as_bytes())
                .await;
            let _ = stream.read_exact(&mut ok).await;
            let _ = stream.write_all(payload).await;
            let _ = stream.read_exact(&mut ok).await;
            let _ = stream.write_all(b"sidecar-reported-checksum\n").await;
        }
        SidecarMode::FailMidTransfer => {
            let mut ok = [0u8; 2];
            let _ = stream.write_all(b"4096").await;
            let _ = stream.read_exact(&mut ok).await;
            let _ = stream.write_all(b"fragment").await;
        }
        SidecarMode::Stall => {
            std::future::pending::<()>().await;
        }
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    scheduler: Scheduler<SystemClock>,
    backup_dir: PathBuf,
    _command_tx: mpsc::Sender<ControlRequest>,
    _dir: tempfile::TempDir,
}

fn harness(max_workers: usize, setup: impl FnOnce(&mut Store)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = dir.path().join("backups");
    std::fs::create_dir_all(&backup_dir).unwrap();

    let mut store = Store::open(&dir.path().join("store.json")).unwrap();
    setup(&mut store);

    let (command_tx, command_rx) = mpsc::channel(8);
    let mut scheduler = Scheduler::new(
        SchedulerConfig {
            backup_dir: backup_dir.clone(),
            max_workers,
        },
        store,
        command_rx,
        SystemClock,
    );
    scheduler.rebuild_schedule();

    Harness {
        scheduler,
        backup_dir,
        _command_tx: command_tx,
        _dir: dir,
    }
}

fn single_task_store(port: u16) -> impl FnOnce(&mut Store) {
    move |store: &mut Store| {
        store
            .add_node(&NodeName::new("n1"), NodeAddress::new("127.0.0.1", port))
            .unwrap();
        store.add_task("n1", "/etc", 1).unwrap();
    }
}

async fn run_until(
    scheduler: &mut Scheduler<SystemClock>,
    mut cond: impl FnMut(&Scheduler<SystemClock>) -> bool,
) {
    for _ in 0..250 {
        scheduler.run_once(POLL).await.unwrap();
        if cond(scheduler) {
            return;
        }
    }
    panic!("scenario condition not reached");
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn fresh_task_dispatch() {
    let port = spawn_sidecar(SidecarMode::Stall).await;
    let mut h = harness(1, single_task_store(port));

    h.scheduler.run_once(POLL).await.unwrap();

    assert_eq!(h.scheduler.running_len(), 1);
    let key = TaskKey::new("n1", "/etc");
    let running = h.scheduler.running_task(&key).unwrap();
    let name = running
        .write_file_path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert!(name.starts_with("backup_"));
    assert!(name.ends_with("_n1_L2V0Yw=="));

    h.scheduler.terminate_workers();
}

#[tokio::test]
async fn successful_reap_records_history() {
    let port = spawn_sidecar(SidecarMode::Payload(PAYLOAD)).await;
    let mut h = harness(1, single_task_store(port));

    run_until(&mut h.scheduler, |s| {
        !s.store().finished_tasks("n1", "/etc").is_empty()
    })
    .await;

    let history = h.scheduler.store().finished_tasks("n1", "/etc");
    assert_eq!(history.len(), 1);
    let record = &history[0];

    let artifact = Path::new(&record.result_path);
    assert_eq!(std::fs::read(artifact).unwrap(), PAYLOAD);
    assert_eq!(record.checksum, digest::file_sha256(artifact).unwrap());
    let expected_kb = PAYLOAD.len() as f64 / 1024.0;
    assert!((record.kb_size - expected_kb).abs() < f64::EPSILON);
    let age = SystemClock.now() - record.timestamp;
    assert!(age.num_seconds() >= 0 && age.num_seconds() < 30);

    // Sentinels consumed: only the artifact remains
    assert_eq!(
        files_in(&h.backup_dir),
        vec![artifact.file_name().unwrap().to_string_lossy().into_owned()]
    );
    assert_eq!(h.scheduler.running_len(), 0);
    // Schedule rebuilt with the new history: no longer due
    assert_eq!(h.scheduler.schedule()[0].last_backup, Some(record.timestamp));
    assert_eq!(h.scheduler.queue_len(), 0);
}

#[tokio::test]
async fn same_outcome_clones_previous_record() {
    let port = spawn_sidecar(SidecarMode::Same).await;
    let mut h = harness(1, single_task_store(port));

    // Seed one finished run, old enough to be due again
    let old_artifact = h.backup_dir.join("backup_100_n1_L2V0Yw==");
    std::fs::write(&old_artifact, b"previous artifact").unwrap();
    let seeded = FinishedTask {
        result_path: old_artifact.display().to_string(),
        kb_size: 17.0 / 1024.0,
        timestamp: SystemClock.now() - chrono::Duration::minutes(10),
        checksum: "seeded-checksum".to_string(),
    };
    h.scheduler
        .store_mut()
        .register_finished_task("n1", "/etc", seeded.clone())
        .unwrap();
    h.scheduler.rebuild_schedule();

    run_until(&mut h.scheduler, |s| {
        s.store().finished_tasks("n1", "/etc").len() >= 2
    })
    .await;

    let history = h.scheduler.store().finished_tasks("n1", "/etc");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].result_path, seeded.result_path);
    assert_eq!(history[0].checksum, seeded.checksum);
    assert!((history[0].kb_size - seeded.kb_size).abs() < f64::EPSILON);
    assert!(history[0].timestamp > seeded.timestamp);

    // No new artifact, no sentinel residue
    assert_eq!(
        files_in(&h.backup_dir),
        vec!["backup_100_n1_L2V0Yw==".to_string()]
    );
}

#[tokio::test]
async fn failed_transfer_is_cleaned_up_and_retried() {
    let port = spawn_sidecar(SidecarMode::FailMidTransfer).await;
    let mut h = harness(1, single_task_store(port));

    // Phase 1: a worker is dispatched
    run_until(&mut h.scheduler, |s| s.running_len() == 1).await;
    let key = TaskKey::new("n1", "/etc");
    let first_path = h
        .scheduler
        .running_task(&key)
        .unwrap()
        .write_file_path()
        .to_path_buf();

    // Phase 2: the failed run's residue is removed and a fresh attempt
    // (with a new write path) replaces it
    run_until(&mut h.scheduler, |s| {
        !first_path.exists()
            && !worker::wip_path(&first_path).exists()
            && s.running_task(&key)
                .map(|t| t.write_file_path() != first_path)
                .unwrap_or(false)
    })
    .await;

    // Nothing was recorded
    assert!(h.scheduler.store().finished_tasks("n1", "/etc").is_empty());

    h.scheduler.terminate_workers();
}

#[tokio::test]
async fn worker_bound_is_respected_while_draining_five_tasks() {
    let port = spawn_sidecar(SidecarMode::Payload(PAYLOAD)).await;
    let paths = ["/a", "/b", "/c", "/d", "/e"];
    let mut h = harness(2, move |store: &mut Store| {
        store
            .add_node(&NodeName::new("n1"), NodeAddress::new("127.0.0.1", port))
            .unwrap();
        for path in paths {
            store.add_task("n1", path, 1).unwrap();
        }
    });

    // First iteration: exactly two dispatched, three queued
    h.scheduler.run_once(POLL).await.unwrap();
    assert_eq!(h.scheduler.running_len(), 2);
    assert_eq!(h.scheduler.queue_len(), 3);

    // Drain to completion; the bound holds on every iteration
    for _ in 0..250 {
        h.scheduler.run_once(POLL).await.unwrap();
        assert!(h.scheduler.running_len() <= 2);
        let done = paths
            .iter()
            .all(|p| !h.scheduler.store().finished_tasks("n1", p).is_empty());
        if done {
            return;
        }
    }
    panic!("not all five tasks completed");
}

#[tokio::test]
async fn gc_keeps_tracked_prefixes_and_drops_the_rest() {
    let mut h = harness(1, |store: &mut Store| {
        store
            .add_node(&NodeName::new("n1"), NodeAddress::new("127.0.0.1", 1))
            .unwrap();
        store.add_task("n1", "/", 1).unwrap();
    });

    let tracked = h.backup_dir.join("backup_100_n1_Lw==");
    std::fs::write(&tracked, b"artifact").unwrap();
    std::fs::write(h.backup_dir.join("backup_100_n1_Lw==.CORRECT"), b"").unwrap();
    std::fs::write(h.backup_dir.join("backup_200_n1_Lw=="), b"orphan").unwrap();

    h.scheduler
        .store_mut()
        .register_finished_task(
            "n1",
            "/",
            FinishedTask {
                result_path: tracked.display().to_string(),
                kb_size: 8.0 / 1024.0,
                timestamp: SystemClock.now(),
                checksum: "c".to_string(),
            },
        )
        .unwrap();

    h.scheduler.clean_backup_dir().unwrap();

    assert_eq!(
        files_in(&h.backup_dir),
        vec![
            "backup_100_n1_Lw==".to_string(),
            "backup_100_n1_Lw==.CORRECT".to_string(),
        ]
    );
}

// ----------------------------------------------------------------------
// Full daemon surface: control socket to recorded history
// ----------------------------------------------------------------------

async fn control_roundtrip(socket_path: &Path, request: &Request) -> Reply {
    let stream = UnixStream::connect(socket_path).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    wire::send(&mut writer, request).await.unwrap();
    wire::recv(&mut reader).await.unwrap()
}

#[tokio::test]
async fn control_socket_drives_a_backup_end_to_end() {
    let port = spawn_sidecar(SidecarMode::Payload(PAYLOAD)).await;
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = dir.path().join("backups");
    std::fs::create_dir_all(&backup_dir).unwrap();
    let socket_path = dir.path().join("control.sock");

    let store = Store::open(&dir.path().join("store.json")).unwrap();
    let (command_tx, command_rx) = mpsc::channel(8);
    let socket = UnixListener::bind(&socket_path).unwrap();
    tokio::spawn(Listener::new(socket, command_tx).run());

    let mut scheduler = Scheduler::new(
        SchedulerConfig {
            backup_dir,
            max_workers: 2,
        },
        store,
        command_rx,
        SystemClock,
    );
    tokio::spawn(async move {
        scheduler.run(POLL).await;
    });

    let reply = control_roundtrip(
        &socket_path,
        &Request::new("add_node")
            .arg("name", "n1")
            .arg("host", "127.0.0.1")
            .arg("port", port),
    )
    .await;
    assert!(reply.is_ok(), "add_node failed: {}", reply.status);

    let reply = control_roundtrip(
        &socket_path,
        &Request::new("add_task")
            .arg("node", "n1")
            .arg("path", "/etc")
            .arg("frequency_minutes", 1),
    )
    .await;
    assert!(reply.is_ok(), "add_task failed: {}", reply.status);

    // Unknown commands come back in the error envelope, loop intact
    let reply = control_roundtrip(&socket_path, &Request::new("bogus")).await;
    assert_eq!(reply.status, "Error unknown command: bogus:");

    // Poll history until the backup lands
    let mut recorded = None;
    for _ in 0..250 {
        let reply = control_roundtrip(
            &socket_path,
            &Request::new("history").arg("node", "n1").arg("path", "/etc"),
        )
        .await;
        assert!(reply.is_ok());
        let entries = reply.data.as_array().unwrap().clone();
        if !entries.is_empty() {
            recorded = Some(entries);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let recorded = recorded.expect("backup never recorded");
    assert_eq!(recorded.len(), 1);
    let artifact = PathBuf::from(recorded[0]["result_path"].as_str().unwrap());
    assert_eq!(std::fs::read(&artifact).unwrap(), PAYLOAD);

    let reply = control_roundtrip(&socket_path, &Request::new("status")).await;
    assert!(reply.is_ok());
    assert_eq!(reply.data["scheduled"], 1);
}
