//! Debounced index rebuilds driven by file-system events.
//!
//! Events of relevant files move [`Debouncer`] into `Pending`; a periodic
//! tick starts one rebuild once the cooldown has passed since the last
//! event. The rebuild runs on the blocking pool so events keep arriving and
//! coalescing while it runs; an event during a rebuild schedules exactly one
//! follow-up.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::document::ScanOptions;
use crate::error::{IndexError, WatchError};
use crate::search::manager::{IndexManager, IndexOrigin, IndexTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    /// Waiting for the cooldown to pass since the last event
    Pending(Instant),
    /// `pending` is set when an event arrived during the rebuild
    Rebuilding { pending: bool },
}

/// The debounce state machine, free of any clock or I/O
#[derive(Debug)]
pub struct Debouncer {
    state: WatchState,
    cooldown: Duration,
    forced: bool,
}

impl Debouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: WatchState::Idle,
            cooldown,
            forced: false,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn is_rebuilding(&self) -> bool {
        matches!(self.state, WatchState::Rebuilding { .. })
    }

    pub fn on_event(&mut self, now: Instant) {
        self.state = match self.state {
            WatchState::Idle | WatchState::Pending(_) => WatchState::Pending(now),
            WatchState::Rebuilding { .. } => WatchState::Rebuilding { pending: true },
        };
    }

    /// Ask for a rebuild; `force` skips the cooldown
    pub fn request(&mut self, now: Instant, force: bool) {
        if force {
            self.forced = true;
            if let WatchState::Rebuilding { .. } = self.state {
                self.state = WatchState::Rebuilding { pending: true };
            }
        } else {
            self.on_event(now);
        }
    }

    /// Returns true when a rebuild should start now
    pub fn on_tick(&mut self, now: Instant) -> bool {
        let due = match self.state {
            WatchState::Idle => self.forced,
            WatchState::Pending(last) => self.forced || now.saturating_duration_since(last) >= self.cooldown,
            WatchState::Rebuilding { .. } => false,
        };
        if due {
            self.state = WatchState::Rebuilding { pending: false };
            self.forced = false;
        }
        due
    }

    pub fn on_rebuild_complete(&mut self, now: Instant) {
        self.state = match self.state {
            WatchState::Rebuilding { pending: true } => WatchState::Pending(now),
            _ => WatchState::Idle,
        };
    }
}

/// Runs one full rebuild; called on the blocking pool
pub trait Rebuilder: Send + Sync + 'static {
    fn rebuild(&self) -> Result<(), IndexError>;
}

/// Forced rebuilds of one target through its [`IndexManager`]
pub struct ManagedRebuild {
    pub manager: Arc<IndexManager>,
    pub target: IndexTarget,
}

impl Rebuilder for ManagedRebuild {
    fn rebuild(&self) -> Result<(), IndexError> {
        let outcome = self.manager.create_or_load(&self.target, true)?;
        if let IndexOrigin::Coalesced = outcome.origin {
            debug!(name = %self.target.name, "rebuild shared with a concurrent request");
        }
        Ok(())
    }
}

/// Which changed paths count as relevant
#[derive(Debug, Clone)]
pub struct PathFilter {
    scan: ScanOptions,
    ignored: Vec<PathBuf>,
}

impl PathFilter {
    /// `ignored` directories (such as the index directory) never count
    pub fn new(scan: ScanOptions, ignored: Vec<PathBuf>) -> Self {
        let mut all = Vec::with_capacity(ignored.len() * 2);
        for dir in ignored {
            if let Ok(canonical) = fs::canonicalize(&dir) {
                all.push(canonical);
            }
            all.push(dir);
        }
        Self { scan, ignored: all }
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        if self.ignored.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }
        !path.is_dir() && self.scan.is_relevant(path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub cooldown: Duration,
    pub tick: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub enum WatchEvent {
    Changed(PathBuf),
    Trigger { force: bool },
}

pub struct WatcherHandle {
    events: mpsc::UnboundedSender<WatchEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    fs_watcher: Option<RecommendedWatcher>,
}

impl WatcherHandle {
    /// `force = false` counts as a file event, `force = true` rebuilds on the
    /// next tick regardless of the cooldown
    pub fn trigger_rebuild(&self, force: bool) {
        let _ = self.events.send(WatchEvent::Trigger { force });
    }

    pub fn notify_change(&self, path: impl Into<PathBuf>) {
        let _ = self.events.send(WatchEvent::Changed(path.into()));
    }

    /// Stop the scheduler. A rebuild already running finishes on the
    /// blocking pool; its result is discarded.
    pub async fn shutdown(mut self) {
        self.fs_watcher.take();
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "watch scheduler ended abnormally");
        }
    }
}

/// Load or build `target` once, then rebuild it whenever relevant files
/// under its source directory change.
///
/// The source directory is created if missing, and file events are captured
/// before the initial build starts, so edits made during it trigger a
/// follow-up. A failed initial build is logged and retried after the
/// cooldown; only setting up the watch is fatal.
///
/// Must be called from outside the runtime's worker threads; the initial
/// index is built synchronously.
pub fn start(
    runtime: &Handle,
    manager: Arc<IndexManager>,
    target: IndexTarget,
    ignored: Vec<PathBuf>,
    options: WatchOptions,
    force_initial: bool,
) -> Result<WatcherHandle, WatchError> {
    let source_dir = target.source_dir.clone();
    fs::create_dir_all(&source_dir).map_err(|source| WatchError::CreateDir {
        path: source_dir.clone(),
        source,
    })?;

    let filter = PathFilter::new(target.scan.clone(), ignored);
    let rebuilder = Arc::new(ManagedRebuild {
        manager: manager.clone(),
        target: target.clone(),
    });
    let mut handle = spawn_scheduler(runtime, rebuilder, filter, options);

    let events = handle.events.clone();
    let setup_err = |source| WatchError::Setup {
        path: source_dir.clone(),
        source,
    };
    let mut fs_watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() => {
            for path in event.paths {
                let _ = events.send(WatchEvent::Changed(path));
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "file watch error"),
    })
    .map_err(setup_err)?;
    fs_watcher
        .watch(&source_dir, RecursiveMode::Recursive)
        .map_err(setup_err)?;
    handle.fs_watcher = Some(fs_watcher);
    info!(dir = %source_dir.display(), cooldown_secs = options.cooldown.as_secs_f64(), "watching for changes");

    match manager.create_or_load(&target, force_initial) {
        Ok(initial) => {
            info!(name = %target.name, records = initial.index.len(), "initial index ready");
        }
        Err(e) => {
            error!(name = %target.name, error = %e, "initial index failed, retrying after cooldown");
            handle.trigger_rebuild(false);
        }
    }
    Ok(handle)
}

/// Start the scheduler alone; changes arrive through
/// [`WatcherHandle::notify_change`].
pub fn spawn_scheduler<R: Rebuilder>(
    runtime: &Handle,
    rebuilder: Arc<R>,
    filter: PathFilter,
    options: WatchOptions,
) -> WatcherHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = runtime.spawn(run_scheduler(rebuilder, filter, options, events_rx, shutdown_rx));
    WatcherHandle {
        events: events_tx,
        shutdown: shutdown_tx,
        task,
        fs_watcher: None,
    }
}

async fn run_scheduler<R: Rebuilder>(
    rebuilder: Arc<R>,
    filter: PathFilter,
    options: WatchOptions,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut debounce = Debouncer::new(options.cooldown);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Result<(), String>>();
    let mut ticker = time::interval(options.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(WatchEvent::Changed(path)) => {
                    if filter.is_relevant(&path) {
                        debounce.on_event(Instant::now());
                        debug!(path = %path.display(), state = ?debounce.state(), "relevant change");
                    }
                }
                Some(WatchEvent::Trigger { force }) => {
                    debounce.request(Instant::now(), force);
                    debug!(force, state = ?debounce.state(), "rebuild requested");
                }
                None => break,
            },
            Some(result) = done_rx.recv() => {
                if let Err(message) = result {
                    error!(error = %message, "rebuild failed, previous index stays active");
                }
                debounce.on_rebuild_complete(Instant::now());
                debug!(state = ?debounce.state(), "rebuild finished");
            }
            _ = ticker.tick() => {
                if debounce.on_tick(Instant::now()) {
                    info!("changes settled, rebuilding index");
                    let rebuilder = rebuilder.clone();
                    let done = done_tx.clone();
                    let job = task::spawn_blocking(move || rebuilder.rebuild());
                    tokio::spawn(async move {
                        let result = match job.await {
                            Ok(result) => result.map_err(|e| e.to_string()),
                            Err(e) => Err(format!("rebuild task failed: {}", e)),
                        };
                        let _ = done.send(result);
                    });
                }
            }
        }
    }

    if debounce.is_rebuilding() {
        info!("stopping with a rebuild in flight, it will finish in the background");
    } else {
        info!("watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    #[test]
    fn test_burst_triggers_one_rebuild_after_last_event() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::from_secs(5));
        let mut started = Vec::new();
        for s in 0..=12 {
            if [0, 2, 4].contains(&s) {
                d.on_event(secs(t0, s));
            }
            if d.on_tick(secs(t0, s)) {
                started.push(s);
            }
        }
        assert_eq!(started, vec![9]);
    }

    #[test]
    fn test_separated_events_rebuild_separately() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::from_secs(5));
        let mut started = Vec::new();
        for s in 0..=30 {
            if s == 0 || s == 20 {
                d.on_event(secs(t0, s));
            }
            if d.on_tick(secs(t0, s)) {
                started.push(s);
                d.on_rebuild_complete(secs(t0, s + 1));
            }
        }
        assert_eq!(started, vec![5, 25]);
    }

    #[test]
    fn test_event_during_rebuild_schedules_follow_up() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::from_secs(5));
        d.on_event(t0);
        assert!(d.on_tick(secs(t0, 5)));
        d.on_event(secs(t0, 6));
        assert_eq!(d.state(), WatchState::Rebuilding { pending: true });
        assert!(!d.on_tick(secs(t0, 20)));

        d.on_rebuild_complete(secs(t0, 7));
        assert_eq!(d.state(), WatchState::Pending(secs(t0, 7)));
        assert!(!d.on_tick(secs(t0, 11)));
        assert!(d.on_tick(secs(t0, 12)));
        d.on_rebuild_complete(secs(t0, 13));
        assert_eq!(d.state(), WatchState::Idle);
    }

    #[test]
    fn test_forced_request_skips_cooldown() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::from_secs(5));
        assert!(!d.on_tick(t0));
        d.request(t0, true);
        assert!(d.on_tick(t0));

        // Forced while rebuilding runs again right after
        d.request(t0, true);
        d.on_rebuild_complete(secs(t0, 1));
        assert!(d.on_tick(secs(t0, 1)));
    }

    #[test]
    fn test_unforced_request_is_debounced() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::from_secs(5));
        d.request(t0, false);
        assert!(!d.on_tick(secs(t0, 4)));
        assert!(d.on_tick(secs(t0, 5)));
    }

    #[test]
    fn test_path_filter() {
        let ignored = PathBuf::from("/kb/indexes");
        let filter = PathFilter::new(ScanOptions::default(), vec![ignored]);
        assert!(filter.is_relevant(Path::new("/kb/notes/a.md")));
        assert!(filter.is_relevant(Path::new("/kb/data.CSV")));
        assert!(!filter.is_relevant(Path::new("/kb/image.png")));
        assert!(!filter.is_relevant(Path::new("/kb/indexes/kb.db")));
        assert!(!filter.is_relevant(Path::new("/kb/indexes/notes.md")));
    }

    struct FakeRebuilder {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeRebuilder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Rebuilder for FakeRebuilder {
        fn rebuild(&self) -> Result<(), IndexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(())
        }
    }

    fn fast_options() -> WatchOptions {
        WatchOptions {
            cooldown: Duration::from_millis(200),
            tick: Duration::from_millis(20),
        }
    }

    fn filter() -> PathFilter {
        PathFilter::new(ScanOptions::default(), Vec::new())
    }

    #[tokio::test]
    async fn test_scheduler_coalesces_burst() {
        let rebuilder = FakeRebuilder::new(Duration::ZERO);
        let handle = spawn_scheduler(&Handle::current(), rebuilder.clone(), filter(), fast_options());

        for name in ["a.md", "b.md", "c.txt"] {
            handle.notify_change(format!("/kb/{}", name));
            time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(rebuilder.calls(), 0);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rebuilder.calls(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_ignores_irrelevant_files() {
        let rebuilder = FakeRebuilder::new(Duration::ZERO);
        let handle = spawn_scheduler(&Handle::current(), rebuilder.clone(), filter(), fast_options());

        handle.notify_change("/kb/photo.png");
        handle.notify_change("/kb/.tmp");
        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rebuilder.calls(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_follow_up_after_event_during_rebuild() {
        let rebuilder = FakeRebuilder::new(Duration::from_millis(300));
        let handle = spawn_scheduler(&Handle::current(), rebuilder.clone(), filter(), fast_options());

        handle.notify_change("/kb/a.md");
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(rebuilder.calls(), 1);

        // First rebuild still sleeping
        handle.notify_change("/kb/b.md");
        time::sleep(Duration::from_millis(800)).await;
        assert_eq!(rebuilder.calls(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_trigger_rebuilds_on_next_tick() {
        let rebuilder = FakeRebuilder::new(Duration::ZERO);
        let options = WatchOptions {
            cooldown: Duration::from_secs(60),
            tick: Duration::from_millis(20),
        };
        let handle = spawn_scheduler(&Handle::current(), rebuilder.clone(), filter(), options);

        handle.trigger_rebuild(false);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rebuilder.calls(), 0);

        handle.trigger_rebuild(true);
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rebuilder.calls(), 1);
        handle.shutdown().await;
    }

    mod watching {
        use super::*;
        use crate::error::ProviderError;
        use crate::search::chunker::ChunkParams;
        use crate::search::provider::{EmbeddingProvider, LocalProvider};
        use crate::search::vectordb::VectorStore;
        use tempfile::TempDir;

        /// Runs `on_first` before answering the first batch
        struct FirstCallProvider<F> {
            inner: LocalProvider,
            calls: AtomicUsize,
            on_first: F,
        }

        impl<F> FirstCallProvider<F>
        where
            F: Fn() -> Result<(), ProviderError> + Send + Sync,
        {
            fn new(on_first: F) -> Self {
                Self {
                    inner: LocalProvider::new(),
                    calls: AtomicUsize::new(0),
                    on_first,
                }
            }
        }

        impl<F> EmbeddingProvider for FirstCallProvider<F>
        where
            F: Fn() -> Result<(), ProviderError> + Send + Sync,
        {
            fn id(&self) -> String {
                self.inner.id()
            }
            fn dimension(&self) -> usize {
                self.inner.dimension()
            }
            fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    (self.on_first)()?;
                }
                self.inner.embed_batch(texts)
            }
        }

        async fn start_watching(
            dir: &TempDir,
            source: PathBuf,
            provider: Arc<dyn EmbeddingProvider>,
        ) -> (Arc<IndexManager>, WatcherHandle) {
            let manager = Arc::new(IndexManager::new(
                provider,
                VectorStore::new(dir.path().join("indexes")),
                ChunkParams::default(),
            ));
            let target = IndexTarget::new("kb", source, ScanOptions::default());
            let runtime = Handle::current();
            let handle = {
                let manager = manager.clone();
                task::spawn_blocking(move || start(&runtime, manager, target, Vec::new(), fast_options(), false))
                    .await
                    .unwrap()
                    .unwrap()
            };
            (manager, handle)
        }

        async fn wait_for_documents(manager: &IndexManager, count: usize) -> bool {
            for _ in 0..100 {
                if manager.active("kb").map(|i| i.document_count()) == Some(count) {
                    return true;
                }
                time::sleep(Duration::from_millis(50)).await;
            }
            false
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_watch_directory_rebuilds_index() {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("kb");
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("a.md"), "first note").unwrap();

            let (manager, handle) = start_watching(&dir, source.clone(), Arc::new(LocalProvider::new())).await;
            assert_eq!(manager.completed_rebuilds("kb"), 1);

            fs::write(source.join("b.md"), "second note").unwrap();
            assert!(wait_for_documents(&manager, 2).await);
            handle.shutdown().await;
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_edit_during_initial_build_is_indexed() {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("kb");
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("a.md"), "first note").unwrap();

            let late = source.join("late.md");
            let provider = FirstCallProvider::new(move || {
                fs::write(&late, "written while the first index was being built").unwrap();
                std::thread::sleep(Duration::from_millis(100));
                Ok(())
            });

            let (manager, handle) = start_watching(&dir, source, Arc::new(provider)).await;
            assert!(wait_for_documents(&manager, 2).await);
            assert!(manager.completed_rebuilds("kb") >= 2);
            handle.shutdown().await;
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_initial_provider_failure_keeps_watching() {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("kb");
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("a.md"), "first note").unwrap();

            let provider = FirstCallProvider::new(|| Err(ProviderError::RateLimited("transient".to_string())));
            let (manager, handle) = start_watching(&dir, source, Arc::new(provider)).await;
            assert!(manager.completed_rebuilds("kb") >= 1);

            // Retried after the cooldown without any file event
            assert!(wait_for_documents(&manager, 1).await);
            handle.shutdown().await;
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_missing_source_dir_is_created() {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("not_yet");

            let (manager, handle) = start_watching(&dir, source.clone(), Arc::new(LocalProvider::new())).await;
            assert!(source.is_dir());
            assert_eq!(manager.active("kb").map(|i| i.len()), Some(0));

            fs::write(source.join("first.md"), "hello").unwrap();
            assert!(wait_for_documents(&manager, 1).await);
            handle.shutdown().await;
        }
    }
}
