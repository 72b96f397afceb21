#![cfg(unix)]

use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use muster::error::{ErrorKind, MusterError};
use muster::store::processes::ProcessStatus;
use muster::store::repo::Repo;
use tempfile::tempdir;

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn sh(script: &str) -> Vec<String> {
    cmd(&["sh", "-c", script])
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn start_stop_lifecycle_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();

    let started = repo
        .processes
        .start("web", &cmd(&["sleep", "30"]), dir.path())
        .unwrap();
    assert_eq!(started.status, ProcessStatus::Running);
    let pid = started.pid.unwrap();

    let err = repo
        .processes
        .start("web", &cmd(&["sleep", "30"]), dir.path())
        .unwrap_err();
    assert!(matches!(err, MusterError::ProcessConflict(_, _)));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let stopped = repo.processes.stop("web", Duration::from_secs(5)).unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert!(!muster::os::pid_alive(pid));

    // Name is reusable once terminal.
    let again = repo
        .processes
        .start("web", &cmd(&["sleep", "30"]), dir.path())
        .unwrap();
    assert_ne!(again.id, started.id);
    repo.processes.stop("web", Duration::from_secs(5)).unwrap();
}

#[test]
fn racing_starts_have_single_winner_integration() {
    let dir = tempdir().unwrap();
    Repo::init(dir.path()).unwrap();

    let racers = 4;
    let root = Arc::new(dir.path().to_path_buf());
    let barrier = Arc::new(Barrier::new(racers));
    let handles: Vec<_> = (0..racers)
        .map(|_| {
            let root = Arc::clone(&root);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let repo = Repo::open(&root).unwrap();
                barrier.wait();
                repo.processes.start("web", &cmd(&["sleep", "30"]), &root)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "expected exactly one successful start");
    assert_eq!(winners[0].status, ProcessStatus::Running);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(err, MusterError::ProcessConflict(_, _)),
            "unexpected error: {err}"
        );
    }

    let repo = Repo::open(dir.path()).unwrap();
    assert_eq!(repo.processes.get("web").unwrap().pid, winners[0].pid);
    let stopped = repo.processes.stop("web", Duration::from_secs(5)).unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
}

#[test]
fn stop_escalates_when_term_is_ignored_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();

    repo.processes
        .start(
            "stubborn",
            &sh("trap '' TERM; echo ready; while true; do sleep 1; done"),
            dir.path(),
        )
        .unwrap();
    // Let the trap install before signalling.
    assert!(wait_until(|| {
        std::fs::read_to_string(repo.muster_root().join("processes/logs/stubborn.log"))
            .is_ok_and(|log| log.contains("ready"))
    }));

    let started = Instant::now();
    let stopped = repo
        .processes
        .stop("stubborn", Duration::from_millis(300))
        .unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert!(stopped.exit_detail.unwrap().contains("killed"));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!muster::os::pid_alive(stopped.pid.unwrap()));
}

#[test]
fn crashed_process_is_reported_failed_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();

    repo.processes
        .start("crash", &sh("exit 3"), dir.path())
        .unwrap();
    assert!(wait_until(|| {
        repo.processes.get("crash").unwrap().status == ProcessStatus::Failed
    }));

    let listed = repo.processes.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ProcessStatus::Failed);

    // Stopping a failed process keeps the failure visible.
    let after = repo.processes.stop("crash", Duration::from_secs(1)).unwrap();
    assert_eq!(after.status, ProcessStatus::Failed);

    let removed = repo.processes.deregister("crash").unwrap();
    assert!(!removed.log_path.exists());
    assert!(matches!(
        repo.processes.get("crash"),
        Err(MusterError::ProcessNotFound(_))
    ));
}

#[test]
fn restart_reuses_command_and_cwd_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir_all(&work).unwrap();

    let first = repo
        .processes
        .start("svc", &sh("pwd; exec sleep 30"), &work)
        .unwrap();
    let second = repo
        .processes
        .restart("svc", Duration::from_secs(5))
        .unwrap();

    assert_eq!(second.status, ProcessStatus::Running);
    assert_eq!(second.command, first.command);
    assert_eq!(second.cwd, work);
    assert_ne!(second.pid, first.pid);
    assert!(!muster::os::pid_alive(first.pid.unwrap()));

    repo.processes.stop("svc", Duration::from_secs(5)).unwrap();
}

#[test]
fn logs_snapshot_tail_and_follow_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();

    repo.processes
        .start(
            "printer",
            &sh("for i in 1 2 3 4 5; do echo line-$i; sleep 0.1; done"),
            dir.path(),
        )
        .unwrap();

    // Follow blocks until the process exits and yields every line.
    let followed: Vec<String> = repo
        .processes
        .logs("printer", None, true)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        followed,
        vec!["line-1", "line-2", "line-3", "line-4", "line-5"]
    );

    let tail: Vec<String> = repo
        .processes
        .logs("printer", Some(2), false)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(tail, vec!["line-4", "line-5"]);
}

#[test]
fn unknown_process_is_not_found_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();
    for err in [
        repo.processes.stop("ghost", Duration::from_secs(1)).unwrap_err(),
        repo.processes.restart("ghost", Duration::from_secs(1)).unwrap_err(),
        repo.processes.logs("ghost", None, false).err().unwrap(),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
