use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use livecode::command::{CommandServer, LiveBackend};
use livecode::scheduler::Scheduler;
use livecode::sync_point::SyncPoint;
use parking_lot::Mutex;
use tracing_subscriber::filter::LevelFilter;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

#[derive(Default)]
struct Recorder {
    loads: AtomicUsize,
    warmed: Mutex<Vec<String>>,
    patched: Mutex<Vec<Vec<String>>>,
    // Advanced by the simulated watched process.
    progress: Arc<AtomicUsize>,
    frozen_while_patching: AtomicBool,
}

impl LiveBackend for Recorder {
    type Module = String;

    fn load_module(&self, path: &str) -> Option<Self::Module> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2));
        (!path.starts_with("missing/")).then(|| format!("module:{path}"))
    }

    fn update_environment_cache(&self, tool: &str) -> bool {
        self.warmed.lock().push(tool.to_string());
        !tool.starts_with("broken/")
    }

    fn apply_patch(&self, modules: &[Self::Module]) -> bool {
        let before = self.progress.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        self.frozen_while_patching
            .store(self.progress.load(Ordering::SeqCst) == before, Ordering::SeqCst);
        self.patched.lock().push(modules.to_vec());
        true
    }
}

fn server(threads: usize) -> CommandServer<Recorder> {
    CommandServer::new(
        Recorder::default(),
        Scheduler::build().threads(threads).finish(),
        Arc::new(SyncPoint::new()),
    )
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn enables_modules_in_submission_order() {
    initialize_tracing();
    let server = server(2);
    let client = server.connect();

    let enabled = client
        .enable_modules(["a", "b", "missing/c", "d"])
        .unwrap();
    assert_eq!(enabled, ["a", "b", "d"]);
    assert_eq!(server.module_count(), 3);
    assert!(server.is_enabled("b"));
    assert!(!server.is_enabled("missing/c"));
    assert_eq!(server.backend().loads.load(Ordering::SeqCst), 4);

    // Every batch task is destroyed once the batch is registered.
    assert_eq!(server.scheduler().task_count(), 0);

    // Already enabled modules are not loaded again.
    let enabled = client.enable_modules(["a", "e"]).unwrap();
    assert_eq!(enabled, ["e"]);
    assert_eq!(server.backend().loads.load(Ordering::SeqCst), 5);
    assert_eq!(server.module_count(), 4);

    client.disconnect().unwrap();
}

#[test]
fn batches_complete_without_workers() {
    initialize_tracing();
    // The command thread executes its own batch while it waits.
    let server = server(0);
    let client = server.connect();

    let enabled = client.enable_modules(["x", "y"]).unwrap();
    assert_eq!(enabled, ["x", "y"]);
    assert_eq!(client.prewarm(["cl"]).unwrap(), 1);

    client.disconnect().unwrap();
}

#[test]
fn batches_larger_than_the_queue_complete_without_workers() {
    initialize_tracing();
    let server = CommandServer::new(
        Recorder::default(),
        Scheduler::build().threads(0).queue_capacity(2).finish(),
        Arc::new(SyncPoint::new()),
    );
    let client = server.connect();

    let (enabled_sender, enabled) = flume::bounded(1);
    let (warmed_sender, warmed) = flume::bounded(1);
    let requester = thread::spawn(move || {
        enabled_sender
            .send(client.enable_modules(["a", "b", "c"]).unwrap())
            .unwrap();
        warmed_sender
            .send(client.prewarm(["cl", "link", "lib"]).unwrap())
            .unwrap();
        client.disconnect().unwrap();
    });

    let enabled = enabled
        .recv_timeout(Duration::from_secs(10))
        .expect("enabling modules stalled");
    assert_eq!(enabled, ["a", "b", "c"]);
    let warmed = warmed
        .recv_timeout(Duration::from_secs(10))
        .expect("prewarming stalled");
    assert_eq!(warmed, 3);
    requester.join().unwrap();
    assert_eq!(server.module_count(), 3);
}

#[test]
fn batches_complete_after_shutdown() {
    initialize_tracing();
    let server = CommandServer::new(
        Recorder::default(),
        Scheduler::build().threads(2).queue_capacity(2).finish(),
        Arc::new(SyncPoint::new()),
    );
    let client = server.connect();

    server.scheduler().shutdown_gracefully().unwrap();
    assert_eq!(client.enable_modules(["a", "b", "c"]).unwrap(), ["a", "b", "c"]);

    let fast = CommandServer::new(
        Recorder::default(),
        Scheduler::build().threads(2).queue_capacity(2).finish(),
        Arc::new(SyncPoint::new()),
    );
    let fast_client = fast.connect();
    fast.scheduler().shutdown();
    assert_eq!(fast_client.prewarm(["cl", "link", "lib"]).unwrap(), 3);
    assert_eq!(fast.scheduler().task_count(), 0);

    client.disconnect().unwrap();
    fast_client.disconnect().unwrap();
}

#[test]
fn prewarm_skips_duplicates_and_empty_paths() {
    initialize_tracing();
    let server = server(2);
    let client = server.connect();

    let warmed = client
        .prewarm(["cl.exe", "link.exe", "cl.exe", "", "broken/ml.exe"])
        .unwrap();
    assert_eq!(warmed, 2);

    let mut visited = server.backend().warmed.lock().clone();
    visited.sort();
    assert_eq!(visited, ["broken/ml.exe", "cl.exe", "link.exe"]);

    client.disconnect().unwrap();
}

#[test]
fn patch_without_watched_code_does_not_block() {
    initialize_tracing();
    let server = server(1);
    let client = server.connect();

    client.enable_modules(["a"]).unwrap();
    assert!(client.apply_patch().unwrap());
    assert_eq!(
        *server.backend().patched.lock(),
        [vec![String::from("module:a")]]
    );

    client.disconnect().unwrap();
}

#[test]
fn patch_freezes_watched_code() {
    initialize_tracing();
    let sync_point = Arc::new(SyncPoint::new());
    let recorder = Recorder::default();
    let progress = recorder.progress.clone();
    let server = CommandServer::new(
        recorder,
        Scheduler::build().threads(2).finish(),
        sync_point.clone(),
    );
    let client = server.connect();
    let stop = AtomicBool::new(false);

    crossbeam_utils::thread::scope(|scope| {
        scope.spawn(|_| {
            while !stop.load(Ordering::SeqCst) {
                sync_point.entry();
                progress.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        });
        wait_until(|| sync_point.is_used());

        client.enable_modules(["a", "b"]).unwrap();
        assert!(client.apply_patch().unwrap());
        assert!(server
            .backend()
            .frozen_while_patching
            .load(Ordering::SeqCst));

        // The watched code resumes after the patch.
        let resumed_from = progress.load(Ordering::SeqCst);
        wait_until(|| progress.load(Ordering::SeqCst) > resumed_from);

        stop.store(true, Ordering::SeqCst);
    })
    .unwrap();

    client.disconnect().unwrap();
}

#[test]
fn clients_share_one_registry() {
    initialize_tracing();
    let server = server(4);
    let first = server.connect();
    let second = server.connect();
    assert_ne!(first.client(), second.client());

    crossbeam_utils::thread::scope(|scope| {
        scope.spawn(|_| {
            let enabled = first.enable_modules(["a", "b", "c"]).unwrap();
            assert_eq!(enabled.len(), 3);
            assert!(first.apply_patch().unwrap());
        });
        scope.spawn(|_| {
            let enabled = second.enable_modules(["d", "e"]).unwrap();
            assert_eq!(enabled.len(), 2);
            assert!(second.apply_patch().unwrap());
        });
    })
    .unwrap();

    assert_eq!(server.module_count(), 5);
    // Each patch saw only fully registered batches.
    for modules in server.backend().patched.lock().iter() {
        assert!(matches!(modules.len(), 2 | 3 | 5), "{modules:?}");
    }

    first.disconnect().unwrap();
    second.disconnect().unwrap();
    server.scheduler().shutdown_gracefully().unwrap();
}
