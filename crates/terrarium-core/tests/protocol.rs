use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use terrarium_core::{
    CommitOrchestrator, CommitStep, DirectorySync, LockAcquireResult, LockError, LockManager,
    LockMode, ManualClock, MemoryStore, ObjectStore, Operation, StateDirectory, SystemClock,
};

const NOW: i64 = 1_700_000_000;

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    dir: StateDirectory,
    local: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(NOW)),
            dir: StateDirectory::new("envs/prod").unwrap(),
            local: TempDir::new().unwrap(),
        }
    }

    fn locks(&self) -> LockManager {
        LockManager::new(self.store.clone(), self.clock.clone())
    }

    fn orchestrator(&self) -> CommitOrchestrator {
        CommitOrchestrator::new(self.store.clone(), self.clock.clone(), 2)
    }

    fn local_state(&self) -> std::path::PathBuf {
        self.dir.local_state_root(self.local.path())
    }

    fn write_local(&self, relative: &str, data: &str) {
        let path = self.local_state().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn remote(&self, prefix: &str) -> Vec<String> {
        self.store.keys(&format!("envs/prod/{}", prefix))
    }
}

fn blocking(retry: u64, timeout: u64) -> LockMode {
    LockMode::Blocking {
        retry_wait: Duration::from_secs(retry),
        timeout: Duration::from_secs(timeout),
    }
}

#[tokio::test]
async fn scenario_a_acquire_without_existing_lock() {
    let h = Harness::new();
    let result = h
        .locks()
        .acquire(&h.dir, Duration::from_secs(600), blocking(1, 0))
        .await
        .unwrap();
    assert_eq!(result, LockAcquireResult::Acquired { expiry: NOW + 600 });
    assert_eq!(h.store.read("envs/prod/.lock").unwrap(), b"1700000600");
    assert!(h.clock.sleeps().is_empty());
}

#[tokio::test]
async fn scenario_b_live_lock_with_zero_timeout() {
    let h = Harness::new();
    h.store.insert("envs/prod/.lock", (NOW + 300).to_string());
    let err = h
        .locks()
        .acquire(&h.dir, Duration::from_secs(600), blocking(1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Contention { expiry } if expiry == NOW + 300));
    assert_eq!(h.store.call_count(Operation::Put), 0);
}

#[tokio::test]
async fn scenario_c_commit_replaces_state() {
    let h = Harness::new();
    h.store.insert("envs/prod/state/a.txt", "a");
    h.store.insert("envs/prod/state/b.txt", "b");
    h.store.insert("envs/prod/.lock", (NOW + 600).to_string());
    h.write_local("c.txt", "c");

    let report = h.orchestrator().commit(&h.dir, h.local.path()).await.unwrap();
    assert_eq!(report.snapshot_id, NOW);
    assert_eq!(report.backed_up, 2);
    assert_eq!(report.uploaded, 1);

    assert_eq!(
        h.remote("backups/"),
        vec![
            "envs/prod/backups/1700000000/a.txt",
            "envs/prod/backups/1700000000/b.txt",
        ]
    );
    assert_eq!(h.remote("state/"), vec!["envs/prod/state/c.txt"]);
    assert!(!h.store.contains("envs/prod/.lock"));
    assert_eq!(h.store.read("envs/prod/backups/1700000000/a.txt").unwrap(), b"a");
}

#[tokio::test]
async fn scenario_d_download_empty_state() {
    let h = Harness::new();
    let sync = DirectorySync::new(h.store.clone(), 2);
    let report = sync.download(&h.dir, h.local.path()).await.unwrap();
    assert_eq!(report.files, 0);
    assert_eq!(h.store.call_count(Operation::Download), 0);
}

#[tokio::test]
async fn scenario_e_blocking_wait_until_expiry() {
    let h = Harness::new();
    h.store.insert("envs/prod/.lock", (NOW + 3).to_string());
    let result = h
        .locks()
        .acquire(&h.dir, Duration::from_secs(600), blocking(1, 5))
        .await
        .unwrap();
    assert_eq!(result, LockAcquireResult::Acquired { expiry: NOW + 3 + 600 });
    assert_eq!(h.clock.sleeps().len(), 3);
}

#[tokio::test]
async fn scenario_e_blocking_wait_real_time() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(SystemClock);
    let dir = StateDirectory::new("envs/rt").unwrap();
    let now = chrono::Utc::now().timestamp();
    store.insert("envs/rt/.lock", (now + 3).to_string());

    let started = Instant::now();
    let result = LockManager::new(store.clone(), clock)
        .acquire(&dir, Duration::from_secs(600), blocking(1, 5))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(result, LockAcquireResult::Acquired { .. }));
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
}

#[tokio::test]
async fn acquire_never_succeeds_over_live_lock() {
    let h = Harness::new();
    h.store.insert("envs/prod/.lock", (NOW + 60).to_string());
    for mode in [blocking(1, 0), blocking(5, 30), LockMode::NonBlocking] {
        let result = h.locks().acquire(&h.dir, Duration::from_secs(10), mode).await;
        assert!(!matches!(result, Ok(LockAcquireResult::Acquired { .. })));
        assert_eq!(h.store.call_count(Operation::Put), 0);
    }
}

#[tokio::test]
async fn lock_download_commit_round_trip() {
    let h = Harness::new();
    h.store.insert("envs/prod/state/main.tf", "v1");
    h.store.insert("envs/prod/state/mod/net.tf", "net");

    h.locks()
        .acquire(&h.dir, Duration::from_secs(600), blocking(1, 0))
        .await
        .unwrap();
    DirectorySync::new(h.store.clone(), 2)
        .download(&h.dir, h.local.path())
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(h.local_state().join("mod/net.tf")).unwrap(), "net");

    h.write_local("main.tf", "v2");
    h.clock.advance(30);
    h.orchestrator().commit(&h.dir, h.local.path()).await.unwrap();

    assert_eq!(h.store.read("envs/prod/state/main.tf").unwrap(), b"v2");
    assert_eq!(h.store.read("envs/prod/state/mod/net.tf").unwrap(), b"net");
    assert_eq!(h.store.read("envs/prod/backups/1700000030/main.tf").unwrap(), b"v1");
    assert!(!h.store.contains("envs/prod/.lock"));
}

#[tokio::test]
async fn commit_without_local_tree_changes_nothing() {
    let h = Harness::new();
    h.store.insert("envs/prod/state/a.txt", "a");
    let err = h
        .orchestrator()
        .commit(&h.dir, h.local.path())
        .await
        .unwrap_err();
    assert_eq!(err.step, CommitStep::Preflight);
    assert_eq!(h.remote("state/"), vec!["envs/prod/state/a.txt"]);
    assert!(h.remote("backups/").is_empty());
}

fn seed_for_retry(h: &Harness) {
    h.store.insert("envs/prod/state/a.txt", "a");
    h.store.insert("envs/prod/state/b.txt", "b");
    h.store.insert("envs/prod/.lock", (NOW + 600).to_string());
    h.write_local("c.txt", "c");
    h.write_local("d.txt", "d");
}

async fn retry_after_failure(op: Operation, expected: CommitStep) -> Harness {
    let h = Harness::new();
    seed_for_retry(&h);
    h.store.fail_on(op, 1);

    let err = h
        .orchestrator()
        .commit(&h.dir, h.local.path())
        .await
        .unwrap_err();
    assert_eq!(err.step, expected);

    h.clock.advance(1);
    h.orchestrator().commit(&h.dir, h.local.path()).await.unwrap();

    assert_eq!(
        h.remote("state/"),
        vec!["envs/prod/state/c.txt", "envs/prod/state/d.txt"]
    );
    assert!(!h.store.contains("envs/prod/.lock"));
    h
}

fn assert_holds_old_state(h: &Harness, epoch: i64) {
    let prefix = format!("envs/prod/backups/{}/", epoch);
    assert_eq!(
        h.store.keys(&prefix),
        vec![format!("{}a.txt", prefix), format!("{}b.txt", prefix)]
    );
}

#[tokio::test]
async fn commit_rerun_after_snapshot_failure() {
    let h = retry_after_failure(Operation::Copy, CommitStep::Snapshot).await;
    // First backup is partial (the failed copy was the first one).
    assert!(h.store.keys("envs/prod/backups/1700000000/").is_empty());
    assert_holds_old_state(&h, NOW + 1);
}

#[tokio::test]
async fn commit_rerun_after_delete_failure() {
    let h = retry_after_failure(Operation::DeleteMany, CommitStep::DeleteState).await;
    assert_holds_old_state(&h, NOW);
    assert_holds_old_state(&h, NOW + 1);
}

#[tokio::test]
async fn commit_rerun_after_upload_failure() {
    let h = retry_after_failure(Operation::PutFile, CommitStep::Upload).await;
    // The first snapshot keeps the state from before the failed commit.
    assert_holds_old_state(&h, NOW);
    let retry_prefix = format!("envs/prod/backups/{}/", NOW + 1);
    assert!(!h.store.keys(&retry_prefix).iter().any(|k| k.ends_with("a.txt")));
}

#[tokio::test]
async fn commit_rerun_after_release_failure() {
    let h = retry_after_failure(Operation::Delete, CommitStep::Release).await;
    assert_holds_old_state(&h, NOW);
    let retry_prefix = format!("envs/prod/backups/{}/", NOW + 1);
    assert_eq!(
        h.store.keys(&retry_prefix),
        vec![format!("{}c.txt", retry_prefix), format!("{}d.txt", retry_prefix)]
    );
}

#[tokio::test]
async fn commit_rerun_in_same_second_keeps_first_backup() {
    let h = Harness::new();
    h.store.insert("envs/prod/state/main.tf", "v1");
    h.store.insert("envs/prod/state/z.tf", "z1");
    h.write_local("main.tf", "v2");
    h.write_local("z.tf", "z2");
    h.store.fail_on(Operation::PutFile, 2);

    let single = CommitOrchestrator::new(h.store.clone(), h.clock.clone(), 1);
    let err = single.commit(&h.dir, h.local.path()).await.unwrap_err();
    assert_eq!(err.step, CommitStep::Upload);
    assert_eq!(h.remote("state/"), vec!["envs/prod/state/main.tf"]);

    let report = single.commit(&h.dir, h.local.path()).await.unwrap();
    assert_eq!(report.snapshot_id, NOW + 1);
    assert_eq!(h.store.read("envs/prod/backups/1700000000/main.tf").unwrap(), b"v1");
    assert_eq!(h.store.read("envs/prod/backups/1700000000/z.tf").unwrap(), b"z1");
    assert_eq!(
        h.store.keys("envs/prod/backups/1700000001/"),
        vec!["envs/prod/backups/1700000001/main.tf"]
    );
    assert_eq!(h.store.read("envs/prod/state/z.tf").unwrap(), b"z2");
}

#[tokio::test]
async fn upload_then_download_is_byte_identical() {
    let h = Harness::new();
    h.write_local("bin.dat", "\u{0}\u{1}\u{2}binary");
    h.write_local("deep/er/x.json", "{\"k\":1}");
    let sync = DirectorySync::new(h.store.clone(), 4);
    sync.upload(&h.dir, h.local.path()).await.unwrap();

    let mirror = TempDir::new().unwrap();
    sync.download(&h.dir, mirror.path()).await.unwrap();
    for relative in ["bin.dat", "deep/er/x.json"] {
        assert_eq!(
            std::fs::read(h.local_state().join(relative)).unwrap(),
            std::fs::read(h.dir.local_state_root(mirror.path()).join(relative)).unwrap()
        );
    }
    assert_eq!(walk(&h.dir.local_state_root(mirror.path())), walk(&h.local_state()));
}

fn walk(root: &Path) -> Vec<String> {
    terrarium_core::walk_local_tree(root)
        .map(|item| item.unwrap().key)
        .collect()
}

#[tokio::test]
async fn store_is_object_safe() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    assert_eq!(store.backend_name(), "memory");
    assert!(store.supports_conditional_writes());
}
