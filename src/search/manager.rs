//! Index lifecycle: load the persisted index when possible, otherwise run a
//! full rebuild (scan, chunk, embed, build, save) and make the result active.
//!
//! At most one rebuild runs per index name. A request that arrives while a
//! rebuild is running queues exactly one follow-up rebuild, which starts when
//! the current one finishes and scans the directory as it is at that moment.
//! Further requests arriving meanwhile wait for that follow-up and share its
//! result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::chunker::{self, ChunkParams};
use super::provider::EmbeddingProvider;
use super::vectordb::{IndexRecord, VectorIndex, VectorStore};
use crate::core::document::{self, ScanOptions};
use crate::error::{BuildError, IndexError, StoreError};

/// What to index and under which name
#[derive(Debug, Clone)]
pub struct IndexTarget {
    pub name: String,
    pub source_dir: PathBuf,
    pub scan: ScanOptions,
}

impl IndexTarget {
    pub fn new(name: impl Into<String>, source_dir: impl Into<PathBuf>, scan: ScanOptions) -> Self {
        Self {
            name: name.into(),
            source_dir: source_dir.into(),
            scan,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RebuildStats {
    pub documents: usize,
    pub chunks: usize,
    pub skipped_files: usize,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub enum IndexOrigin {
    /// Persisted index loaded without re-embedding
    Loaded,
    /// This call ran the rebuild
    Rebuilt(RebuildStats),
    /// This call shared the result of a queued follow-up rebuild
    Coalesced,
}

#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub index: Arc<VectorIndex>,
    pub origin: IndexOrigin,
}

/// Summary of a persisted index
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub name: String,
    pub path: PathBuf,
    pub records: usize,
    pub documents: usize,
    pub dimension: usize,
    pub provider_id: String,
    pub built_at: i64,
    pub file_size: u64,
}

#[derive(Default)]
struct FlightState {
    running: bool,
    queued: bool,
    /// The finished rebuild passed the slot straight to the queued follow-up
    handoff: bool,
    completed: u64,
    last: Option<Result<Arc<VectorIndex>, String>>,
}

#[derive(Default)]
struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

pub struct IndexManager {
    provider: Arc<dyn EmbeddingProvider>,
    store: VectorStore,
    chunking: ChunkParams,
    active: RwLock<HashMap<String, Arc<VectorIndex>>>,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl IndexManager {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, store: VectorStore, chunking: ChunkParams) -> Self {
        Self {
            provider,
            store,
            chunking,
            active: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// Load the persisted index for `target`, or rebuild it.
    ///
    /// A missing, corrupt or foreign-provider index is rebuilt. With
    /// `force_rebuild` the persisted index is ignored.
    pub fn create_or_load(&self, target: &IndexTarget, force_rebuild: bool) -> Result<IndexOutcome, IndexError> {
        if !force_rebuild {
            match self.load_compatible(&target.name) {
                Ok(index) => {
                    let index = Arc::new(index);
                    self.activate(&target.name, index.clone());
                    info!(name = %target.name, records = index.len(), "loaded existing index");
                    return Ok(IndexOutcome {
                        index,
                        origin: IndexOrigin::Loaded,
                    });
                }
                Err(StoreError::NotFound(_)) => {
                    info!(name = %target.name, "no persisted index, building a new one");
                }
                Err(e) if e.requires_rebuild() => {
                    warn!(name = %target.name, error = %e, "persisted index unusable, rebuilding");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.rebuild_single_flight(target)
    }

    /// Active index for `target`, loading or building it on first use
    pub fn current(&self, target: &IndexTarget) -> Result<Arc<VectorIndex>, IndexError> {
        if let Some(index) = self.active(&target.name) {
            return Ok(index);
        }
        Ok(self.create_or_load(target, false)?.index)
    }

    pub fn active(&self, name: &str) -> Option<Arc<VectorIndex>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Rebuild executions finished for `name`, successful or not
    pub fn completed_rebuilds(&self, name: &str) -> u64 {
        let flight = self.flight(name);
        let completed = lock(&flight.state).completed;
        completed
    }

    pub fn status(&self, name: &str) -> Result<Option<IndexStatus>, StoreError> {
        let index = match self.store.load(name) {
            Ok(index) => index,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(IndexStatus {
            name: name.to_string(),
            path: self.store.path_for(name)?,
            records: index.len(),
            documents: index.document_count(),
            dimension: index.dimension(),
            provider_id: index.provider_id().to_string(),
            built_at: index.built_at(),
            file_size: self.store.file_size(name).unwrap_or(0),
        }))
    }

    fn load_compatible(&self, name: &str) -> Result<VectorIndex, StoreError> {
        let index = self.store.load(name)?;
        let current = self.provider.id();
        if index.provider_id() != current || index.dimension() != self.provider.dimension() {
            return Err(StoreError::ProviderMismatch {
                name: name.to_string(),
                stored: format!("{} ({} dims)", index.provider_id(), index.dimension()),
                current: format!("{} ({} dims)", current, self.provider.dimension()),
            });
        }
        Ok(index)
    }

    fn activate(&self, name: &str, index: Arc<VectorIndex>) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), index);
    }

    fn flight(&self, name: &str) -> Arc<Flight> {
        lock(&self.flights).entry(name.to_string()).or_default().clone()
    }

    fn rebuild_single_flight(&self, target: &IndexTarget) -> Result<IndexOutcome, IndexError> {
        let flight = self.flight(&target.name);
        let mut state = lock(&flight.state);

        if !state.running {
            state.running = true;
            drop(state);
            return self.run_flight(&flight, target);
        }

        if state.queued {
            // Running rebuild finishes at +1, the queued follow-up at +2
            let until = state.completed + 2;
            debug!(name = %target.name, "rebuild already queued, waiting for it");
            let state = flight
                .done
                .wait_while(state, |s| s.completed < until)
                .unwrap_or_else(PoisonError::into_inner);
            return match &state.last {
                Some(Ok(index)) => Ok(IndexOutcome {
                    index: index.clone(),
                    origin: IndexOrigin::Coalesced,
                }),
                Some(Err(message)) => Err(IndexError::Coalesced {
                    name: target.name.clone(),
                    message: message.clone(),
                }),
                None => Err(IndexError::Coalesced {
                    name: target.name.clone(),
                    message: "no result recorded".to_string(),
                }),
            };
        }

        state.queued = true;
        debug!(name = %target.name, "rebuild in progress, follow-up queued");
        let mut state = flight
            .done
            .wait_while(state, |s| !s.handoff)
            .unwrap_or_else(PoisonError::into_inner);
        state.handoff = false;
        drop(state);
        self.run_flight(&flight, target)
    }

    /// Run one rebuild while holding the flight's slot
    fn run_flight(&self, flight: &Flight, target: &IndexTarget) -> Result<IndexOutcome, IndexError> {
        let mut completion = FlightCompletion { flight, outcome: None };
        let result = self.rebuild(target);
        completion.outcome = Some(match &result {
            Ok((index, _)) => Ok(index.clone()),
            Err(e) => Err(e.to_string()),
        });
        drop(completion);

        result.map(|(index, stats)| IndexOutcome {
            index,
            origin: IndexOrigin::Rebuilt(stats),
        })
    }

    /// Full rebuild. The persisted and active indexes change only on success.
    fn rebuild(&self, target: &IndexTarget) -> Result<(Arc<VectorIndex>, RebuildStats), IndexError> {
        let start = Instant::now();
        if !target.source_dir.is_dir() {
            return Err(IndexError::MissingSource(target.source_dir.clone()));
        }
        info!(name = %target.name, dir = %target.source_dir.display(), "rebuilding index");

        let report = document::scan(&target.source_dir, &target.scan);
        let chunked: Vec<_> = report
            .documents
            .iter()
            .flat_map(|doc| {
                chunker::split_text(&doc.id, doc.indexed_text(&target.scan), self.chunking)
                    .into_iter()
                    .map(move |chunk| (doc, chunk))
            })
            .collect();

        let texts: Vec<&str> = chunked.iter().map(|(_, c)| c.text.as_str()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.provider.embed_batch(&texts)?
        };
        if vectors.len() != chunked.len() {
            return Err(BuildError::CountMismatch {
                records: vectors.len(),
                chunks: chunked.len(),
            }
            .into());
        }

        let records: Vec<IndexRecord> = chunked
            .iter()
            .zip(vectors)
            .map(|((doc, chunk), vector)| IndexRecord::from_chunk(doc, chunk, vector))
            .collect();
        let index = VectorIndex::build(self.provider.id(), self.provider.dimension(), records)?;
        self.store.save(&index, &target.name)?;

        let index = Arc::new(index);
        self.activate(&target.name, index.clone());

        let stats = RebuildStats {
            documents: report.documents.len(),
            chunks: index.len(),
            skipped_files: report.errors.len(),
            duration_ms: start.elapsed().as_millis(),
        };
        info!(
            name = %target.name,
            documents = stats.documents,
            chunks = stats.chunks,
            skipped = stats.skipped_files,
            duration_ms = stats.duration_ms as u64,
            "index rebuilt"
        );
        Ok((index, stats))
    }
}

/// Releases the flight slot when dropped, also if the rebuild panicked
struct FlightCompletion<'a> {
    flight: &'a Flight,
    outcome: Option<Result<Arc<VectorIndex>, String>>,
}

impl Drop for FlightCompletion<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err("rebuild panicked".to_string()));
        let mut state = lock(&self.flight.state);
        state.completed += 1;
        state.last = Some(outcome);
        if state.queued {
            state.queued = false;
            state.handoff = true;
        } else {
            state.running = false;
        }
        self.flight.done.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::search::provider::LocalProvider;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct CountingProvider {
        inner: LocalProvider,
        calls: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: LocalProvider::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EmbeddingProvider for CountingProvider {
        fn id(&self) -> String {
            self.inner.id()
        }
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_batch(texts)
        }
    }

    /// Blocks its first call until the test opens the gate
    struct GatedProvider {
        inner: LocalProvider,
        calls: AtomicUsize,
        entered: Mutex<mpsc::Sender<()>>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl EmbeddingProvider for GatedProvider {
        fn id(&self) -> String {
            self.inner.id()
        }
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = lock(&self.entered).send(());
                let _ = lock(&self.gate).recv();
            }
            self.inner.embed_batch(texts)
        }
    }

    struct FailingProvider;

    impl EmbeddingProvider for FailingProvider {
        fn id(&self) -> String {
            LocalProvider::new().id()
        }
        fn dimension(&self) -> usize {
            LocalProvider::new().dimension()
        }
        fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Err(ProviderError::Network("connection refused".to_string()))
        }
    }

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        indexes: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("kb");
            let indexes = dir.path().join("indexes");
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("gpu.md"), "---\ntags: [tech]\n---\nGPU memory sharing on the desktop").unwrap();
            fs::write(source.join("cooking.txt"), "Slow cooked recipes for winter evenings").unwrap();
            Self {
                _dir: dir,
                source,
                indexes,
            }
        }

        fn target(&self) -> IndexTarget {
            IndexTarget::new("kb", &self.source, ScanOptions::default())
        }

        fn manager(&self, provider: Arc<dyn EmbeddingProvider>) -> IndexManager {
            IndexManager::new(provider, VectorStore::new(&self.indexes), ChunkParams::new(20, 5).unwrap())
        }
    }

    fn doc_ids(index: &VectorIndex) -> Vec<String> {
        let mut ids: Vec<String> = index.records().iter().map(|r| r.metadata.doc_id.clone()).collect();
        ids.dedup();
        ids
    }

    #[test]
    fn test_builds_when_missing_then_loads_cheaply() {
        let fx = Fixture::new();
        let first = fx.manager(Arc::new(LocalProvider::new()));
        let built = first.create_or_load(&fx.target(), false).unwrap();
        assert!(matches!(built.origin, IndexOrigin::Rebuilt(_)));

        let chunk_count: usize = document::scan(&fx.source, &ScanOptions::default())
            .documents
            .iter()
            .map(|d| chunker::split(d, ChunkParams::new(20, 5).unwrap()).len())
            .sum();
        assert_eq!(built.index.len(), chunk_count);

        let provider = Arc::new(CountingProvider::new());
        let second = fx.manager(provider.clone());
        let loaded = second.create_or_load(&fx.target(), false).unwrap();
        assert!(matches!(loaded.origin, IndexOrigin::Loaded));
        assert_eq!(loaded.index.len(), built.index.len());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_force_rebuild_reembeds() {
        let fx = Fixture::new();
        let provider = Arc::new(CountingProvider::new());
        let manager = fx.manager(provider.clone());
        manager.create_or_load(&fx.target(), false).unwrap();
        fs::write(fx.source.join("new.md"), "fresh content").unwrap();

        let outcome = manager.create_or_load(&fx.target(), true).unwrap();
        assert!(matches!(outcome.origin, IndexOrigin::Rebuilt(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(doc_ids(&outcome.index).contains(&"new.md".to_string()));
        assert!(Arc::ptr_eq(&manager.active("kb").unwrap(), &outcome.index));
    }

    #[test]
    fn test_foreign_provider_index_is_rebuilt() {
        struct OtherProvider(LocalProvider);
        impl EmbeddingProvider for OtherProvider {
            fn id(&self) -> String {
                "other:model".to_string()
            }
            fn dimension(&self) -> usize {
                self.0.dimension()
            }
            fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
                self.0.embed_batch(texts)
            }
        }

        let fx = Fixture::new();
        fx.manager(Arc::new(LocalProvider::new()))
            .create_or_load(&fx.target(), false)
            .unwrap();

        let other = fx.manager(Arc::new(OtherProvider(LocalProvider::new())));
        let outcome = other.create_or_load(&fx.target(), false).unwrap();
        assert!(matches!(outcome.origin, IndexOrigin::Rebuilt(_)));
        assert_eq!(outcome.index.provider_id(), "other:model");
    }

    #[test]
    fn test_provider_failure_keeps_previous_index() {
        let fx = Fixture::new();
        let good = fx.manager(Arc::new(LocalProvider::new()));
        let original = good.create_or_load(&fx.target(), false).unwrap().index;

        let failing = fx.manager(Arc::new(FailingProvider));
        let err = failing.create_or_load(&fx.target(), true).unwrap_err();
        assert!(matches!(err, IndexError::Provider(ProviderError::Network(_))));
        assert!(failing.active("kb").is_none());
        assert_eq!(failing.completed_rebuilds("kb"), 1);

        let persisted = VectorStore::new(&fx.indexes).load("kb").unwrap();
        assert_eq!(persisted.records(), original.records());
    }

    #[test]
    fn test_missing_source_dir() {
        let fx = Fixture::new();
        let manager = fx.manager(Arc::new(LocalProvider::new()));
        let target = IndexTarget::new("kb", fx.source.join("absent"), ScanOptions::default());
        assert!(matches!(
            manager.create_or_load(&target, true),
            Err(IndexError::MissingSource(_))
        ));
    }

    #[test]
    fn test_concurrent_rebuilds_coalesce_into_one_follow_up() {
        let fx = Fixture::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let provider = Arc::new(GatedProvider {
            inner: LocalProvider::new(),
            calls: AtomicUsize::new(0),
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        });
        let manager = Arc::new(fx.manager(provider.clone()));
        let target = fx.target();

        let spawn = |manager: Arc<IndexManager>, target: IndexTarget| {
            thread::spawn(move || manager.create_or_load(&target, true))
        };

        let first = spawn(manager.clone(), target.clone());
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        // Written while the first rebuild is in flight
        fs::write(fx.source.join("late.md"), "Added during the first rebuild").unwrap();
        let second = spawn(manager.clone(), target.clone());
        thread::sleep(Duration::from_millis(150));
        let third = spawn(manager.clone(), target.clone());
        thread::sleep(Duration::from_millis(150));

        gate_tx.send(()).unwrap();
        let first = first.join().unwrap().unwrap();
        let second = second.join().unwrap().unwrap();
        let third = third.join().unwrap().unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.completed_rebuilds("kb"), 2);

        assert!(!doc_ids(&first.index).contains(&"late.md".to_string()));
        assert!(matches!(second.origin, IndexOrigin::Rebuilt(_)));
        assert!(doc_ids(&second.index).contains(&"late.md".to_string()));
        assert!(matches!(third.origin, IndexOrigin::Coalesced));
        assert!(Arc::ptr_eq(&second.index, &third.index));
    }

    #[test]
    fn test_sequential_rebuilds_do_not_coalesce() {
        let fx = Fixture::new();
        let provider = Arc::new(CountingProvider::new());
        let manager = fx.manager(provider.clone());
        for _ in 0..3 {
            manager.create_or_load(&fx.target(), true).unwrap();
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.completed_rebuilds("kb"), 3);
    }

    #[test]
    fn test_status_reports_persisted_index() {
        let fx = Fixture::new();
        let manager = fx.manager(Arc::new(LocalProvider::new()));
        assert!(manager.status("kb").unwrap().is_none());

        let outcome = manager.create_or_load(&fx.target(), false).unwrap();
        let status = manager.status("kb").unwrap().unwrap();
        assert_eq!(status.records, outcome.index.len());
        assert_eq!(status.documents, 2);
        assert!(status.file_size > 0);
    }
}
