use std::sync::{Arc, Barrier};

use muster::error::{ErrorKind, MusterError};
use muster::store::ports::PortRange;
use muster::store::repo::Repo;
use tempfile::tempdir;

#[test]
fn concurrent_allocations_are_disjoint_integration() {
    let dir = tempdir().unwrap();
    Repo::init(dir.path()).unwrap();

    let workers = 12;
    let root = Arc::new(dir.path().to_path_buf());
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let root = Arc::clone(&root);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let repo = Repo::open(&root).unwrap();
                barrier.wait();
                repo.ports.allocate(10, &format!("worker-{i}")).unwrap()
            })
        })
        .collect();

    let mut ranges: Vec<PortRange> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ranges.sort();
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            assert!(!a.overlaps(b), "{a} overlaps {b}");
        }
    }
    // Lowest-fit packs them from the base.
    assert_eq!(ranges[0], PortRange::new(3000, 3009));
    assert_eq!(ranges[workers - 1], PortRange::new(3110, 3119));

    let repo = Repo::open(dir.path()).unwrap();
    assert_eq!(repo.ports.list().unwrap().len(), workers);
}

#[test]
fn released_gap_is_reused_first_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();
    let a = repo.ports.allocate(10, "a").unwrap();
    let b = repo.ports.allocate(10, "b").unwrap();
    assert_eq!(a, PortRange::new(3000, 3009));
    assert_eq!(b, PortRange::new(3010, 3019));

    repo.ports.release(a).unwrap();
    assert_eq!(repo.ports.allocate(10, "c").unwrap(), a);
    // Too wide for the gap: goes after b.
    repo.ports.release(a).unwrap();
    assert_eq!(
        repo.ports.allocate(11, "d").unwrap(),
        PortRange::new(3020, 3030)
    );
}

#[test]
fn release_requires_exact_match_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();
    repo.ports.allocate(10, "a").unwrap();

    let err = repo.ports.release(PortRange::new(3000, 3004)).unwrap_err();
    assert!(matches!(err, MusterError::PortRangeNotAllocated(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(repo.ports.is_allocated(PortRange::new(3000, 3009)).unwrap());
}

#[test]
fn exhaustion_is_reported_integration() {
    let dir = tempdir().unwrap();
    let repo = Repo::init(dir.path()).unwrap();
    let err = repo.ports.allocate(2000, "greedy").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(repo.ports.list().unwrap().is_empty());
}
