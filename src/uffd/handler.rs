use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::UnixListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::HandlerConfig;
use super::error::{HandshakeError, RestoreError, SetupError};
use super::fault::LazyFaultServer;
use super::handshake::receive_handshake;
use super::mapping::SnapshotMapping;
use super::populate::{build_jobs, plan_regions, populate, PopulateReport, RegionPlan};
use super::preload::Preloader;
use super::resolver::{ResolverFactory, UffdFactory};

/// Lifecycle of a restore handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Created,
    Listening,
    /// Snapshot mapped; scanning and warming run in the background.
    Preloading,
    AwaitingConnection,
    Populating,
    /// Eager phase done; hole faults are served with zero pages.
    LazyServing,
    /// Eager phase done on a fully dense snapshot; nothing left to serve.
    Idle,
    Closed,
}

impl HandlerState {
    /// Whether the lifecycle may move from `self` to `next`. `Closed` is
    /// reachable from everywhere and never left.
    pub fn can_advance_to(self, next: HandlerState) -> bool {
        use HandlerState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, Listening)
            | (Listening, Preloading)
            | (Preloading, AwaitingConnection)
            | (AwaitingConnection, Populating)
            | (Populating, LazyServing)
            | (Populating, Idle) => true,
            _ => false,
        }
    }
}

fn advance(state: &watch::Sender<HandlerState>, next: HandlerState) {
    state.send_if_modified(|current| {
        if current.can_advance_to(next) {
            debug!(target: "uffd", from = ?*current, to = ?next, "handler state");
            *current = next;
            true
        } else {
            false
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything released by `close()`.
struct Resources<R> {
    listener: Option<Arc<UnixListener>>,
    mapping: Option<Arc<SnapshotMapping>>,
    resolver: Option<Arc<R>>,
    closed: bool,
}

enum Outcome {
    Pending(oneshot::Receiver<Result<PopulateReport, RestoreError>>),
    Succeeded(PopulateReport),
    Consumed,
}

/// On-demand paging handler for one snapshot restore.
///
/// The handler will:
/// 1. Bind the Unix socket at `socket_path` (before `start` returns)
/// 2. Memory-map the snapshot and warm its data extents in the background
/// 3. Accept Firecracker's connection and receive the UFFD plus region layout
/// 4. Copy every data page into the guest with parallel UFFDIO_COPY
/// 5. Answer later faults on holes with zero pages until closed
pub struct RestoreHandler<F: ResolverFactory = UffdFactory> {
    socket_path: PathBuf,
    cancel: CancellationToken,
    state: Arc<watch::Sender<HandlerState>>,
    resources: Arc<Mutex<Resources<F::Resolver>>>,
    outcome: tokio::sync::Mutex<Outcome>,
    /// Restore task; it goes on to run the lazy fault loop.
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RestoreHandler<UffdFactory> {
    /// Start a handler that adopts the received descriptor as a userfaultfd.
    pub async fn start(config: HandlerConfig) -> Result<Self, SetupError> {
        Self::start_with(config, UffdFactory).await
    }
}

impl<F: ResolverFactory> RestoreHandler<F> {
    /// Bind the socket, start preloading, and spawn the task that accepts
    /// Firecracker and populates guest memory. The socket exists when this
    /// returns.
    pub async fn start_with(config: HandlerConfig, factory: F) -> Result<Self, SetupError> {
        info!(
            target: "uffd",
            socket = %config.socket_path.display(),
            mem_file = %config.mem_file.display(),
            workers = config.workers,
            "creating UFFD restore handler"
        );
        let (state, _) = watch::channel(HandlerState::Created);
        let state = Arc::new(state);
        let socket_path = config.socket_path().to_path_buf();

        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SetupError::SocketDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        // Remove stale socket (ignore errors if not exists - avoids TOCTOU race)
        let _ = tokio::fs::remove_file(&socket_path).await;

        let listener = Arc::new(UnixListener::bind(&socket_path).map_err(|source| {
            SetupError::Bind {
                path: socket_path.clone(),
                source,
            }
        })?);
        advance(&state, HandlerState::Listening);

        let cancel = CancellationToken::new();
        let mut preloader =
            match Preloader::start(&config.mem_file, config.warm_chunk_size, cancel.clone()) {
                Ok(preloader) => preloader,
                Err(e) => {
                    drop(listener);
                    let _ = std::fs::remove_file(&socket_path);
                    return Err(e);
                }
            };
        advance(&state, HandlerState::Preloading);

        let resources = Arc::new(Mutex::new(Resources {
            listener: Some(Arc::clone(&listener)),
            mapping: Some(Arc::clone(preloader.mapping())),
            resolver: None,
            closed: false,
        }));

        let (done_tx, done_rx) = oneshot::channel();
        let restore = Restore {
            config,
            factory,
            listener,
            cancel: cancel.clone(),
            state: Arc::clone(&state),
            resources: Arc::clone(&resources),
        };
        let lazy_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let (result, lazy) = match restore.run(&mut preloader).await {
                Ok((report, lazy)) => (Ok(report), lazy),
                Err(e) => (Err(e), None),
            };
            match &result {
                Ok(report) => info!(
                    target: "uffd",
                    jobs = report.jobs,
                    workers = report.workers,
                    copied_mb = report.bytes / (1024 * 1024),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "eager population complete"
                ),
                Err(RestoreError::Cancelled) => {
                    debug!(target: "uffd", "restore cancelled before population finished")
                }
                Err(e) => warn!(target: "uffd", error = ?e, "UFFD population failed"),
            }
            let _ = done_tx.send(result);

            preloader.join().await;
            drop(preloader);
            if let Some(server) = lazy {
                server.run(lazy_cancel).await;
            }
        });

        info!(target: "uffd", socket = %socket_path.display(), "UFFD handler listening");

        Ok(Self {
            socket_path,
            cancel,
            state,
            resources,
            outcome: tokio::sync::Mutex::new(Outcome::Pending(done_rx)),
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Get the socket path Firecracker should connect to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> HandlerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<HandlerState> {
        self.state.subscribe()
    }

    /// Block until eager population finishes, or until `cancel` (or
    /// [`close`](Self::close)) fires, which yields [`RestoreError::Cancelled`].
    ///
    /// A successful outcome can be observed any number of times; a failure is
    /// reported once.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<PopulateReport, RestoreError> {
        let mut outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            guard = self.outcome.lock() => guard,
        };
        let rx = match &mut *outcome {
            Outcome::Pending(rx) => rx,
            Outcome::Succeeded(report) => return Ok(report.clone()),
            Outcome::Consumed => return Err(RestoreError::OutcomeConsumed),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            _ = self.cancel.cancelled() => return Err(RestoreError::Cancelled),
            done = rx => done.unwrap_or(Err(RestoreError::Cancelled)),
        };
        *outcome = match &result {
            Ok(report) => Outcome::Succeeded(report.clone()),
            Err(_) => Outcome::Consumed,
        };
        result
    }

    /// Tear the handler down: cancel background work, release the fault
    /// descriptor, unmap the snapshot, close the socket and remove its file.
    ///
    /// Idempotent and callable from any thread without a runtime. Only the
    /// handler's own references are released here; the background task drops
    /// its references once it observes the cancellation. Use
    /// [`shutdown`](Self::shutdown) to wait for that.
    pub fn close(&self) {
        let mut resources = lock(&self.resources);
        if resources.closed {
            return;
        }
        resources.closed = true;

        self.cancel.cancel();
        drop(resources.resolver.take());
        drop(resources.mapping.take());
        drop(resources.listener.take());
        drop(resources);

        // Clean up socket file (ignore NotFound - handles concurrent cleanup)
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "uffd", error = %e, "failed to remove UFFD socket during cleanup");
            }
        }
        advance(&self.state, HandlerState::Closed);
        info!(target: "uffd", socket = %self.socket_path.display(), "UFFD handler closed");
    }

    /// Cancel background work, wait for the restore task and lazy fault loop
    /// to exit, then [`close`](Self::close). When this returns the fault
    /// descriptor is closed and the snapshot unmapped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!(target: "uffd", error = %e, "restore task failed");
            }
        }
        drop(task);
        self.close();
    }
}

impl<F: ResolverFactory> Drop for RestoreHandler<F> {
    fn drop(&mut self) {
        self.close();
    }
}

/// State moved into the background restore task.
struct Restore<F: ResolverFactory> {
    config: HandlerConfig,
    factory: F,
    listener: Arc<UnixListener>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<HandlerState>>,
    resources: Arc<Mutex<Resources<F::Resolver>>>,
}

/// Eager outcome plus the lazy server to run afterwards, if any.
type Restored<R> = (PopulateReport, Option<LazyFaultServer<R>>);

impl<F: ResolverFactory> Restore<F> {
    async fn run(self, preloader: &mut Preloader) -> Result<Restored<F::Resolver>, RestoreError> {
        let Restore {
            config,
            factory,
            listener,
            cancel,
            state,
            resources,
        } = self;

        advance(&state, HandlerState::AwaitingConnection);

        // Accept connection from Firecracker (blocks until snapshot load)
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            accepted = listener.accept() => accepted.map_err(HandshakeError::Accept)?.0,
        };
        drop(listener);
        info!(target: "uffd", "Firecracker connected");

        let handshake = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            hs = receive_handshake(stream, config.handshake_attempts) => hs?,
        };
        for region in &handshake.regions {
            info!(
                target: "uffd",
                base = %region.base,
                size_mb = region.size / (1024 * 1024),
                offset = region.file_offset.raw(),
                page_size = region.page_size,
                "received memory region"
            );
        }

        let resolver = Arc::new(factory.adopt(handshake.fd).map_err(HandshakeError::Adopt)?);
        {
            let mut resources = lock(&resources);
            if resources.closed {
                return Err(RestoreError::Cancelled);
            }
            resources.resolver = Some(Arc::clone(&resolver));
        }
        advance(&state, HandlerState::Populating);

        let extents = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            extents = preloader.extents() => extents,
        };
        // Wait for page cache warming before UFFDIO_COPY
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            _ = preloader.warmed() => {}
        }

        let mapping = Arc::clone(preloader.mapping());
        let plans: Arc<[RegionPlan]> =
            plan_regions(&handshake.regions, &extents, mapping.len()).into();
        let jobs = build_jobs(&plans, config.chunk_size);
        debug!(target: "uffd", jobs = jobs.len(), sparse = extents.is_sparse(), "copy jobs built");

        let report = {
            let mapping = Arc::clone(&mapping);
            let resolver = Arc::clone(&resolver);
            let cancel = cancel.clone();
            let workers = config.workers;
            tokio::task::spawn_blocking(move || {
                populate(&jobs, workers, &mapping, &*resolver, &cancel)
            })
            .await
            .map_err(|e| RestoreError::Task(e.to_string()))??
        };

        // The populator has returned; the lazy server is now the only user
        // of the descriptor.
        if extents.is_sparse() {
            advance(&state, HandlerState::LazyServing);
            Ok((report, Some(LazyFaultServer::new(resolver, plans, mapping))))
        } else {
            advance(&state, HandlerState::Idle);
            Ok((report, None))
        }
    }
}
