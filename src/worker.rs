//! The worker: process-wide state and the host event dispatch table.
//!
//! State is established at install/activate and torn down only when the
//! host retires the process. Registry and queue handles are passed into
//! every handler explicitly; there is no ambient global state.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{reap, CacheStore, GenerationId, Populator, Registry};
use crate::config::Config;
use crate::event::{HostBridge, HostEvent};
use crate::intercept::Interceptor;
use crate::notify::Dispatcher;
use crate::origin::{DeliverWrite, Fetch};
use crate::queue::{OfflineQueue, QueueConfig, QueueStore, QueuedWrite};

/// Lifecycle state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// No generation installed by this worker yet
  Idle,
  /// Static generation installed, not yet serving
  Installed,
  /// Active generation pair serving intercepted requests
  Active,
}

/// The interception worker.
pub struct Worker<S, Q, F, B>
where
  S: CacheStore + 'static,
  Q: QueueStore + 'static,
  F: Fetch + DeliverWrite + 'static,
  B: HostBridge,
{
  state: WorkerState,
  version: String,
  manifest: Vec<String>,
  registry: Arc<Registry<S>>,
  queue: Arc<OfflineQueue<Q>>,
  fetcher: Arc<F>,
  populator: Populator<F>,
  interceptor: Arc<Interceptor<S, F>>,
  dispatcher: Dispatcher<B>,
  bridge: Arc<B>,
}

impl<S, Q, F, B> Worker<S, Q, F, B>
where
  S: CacheStore + 'static,
  Q: QueueStore + 'static,
  F: Fetch + DeliverWrite + 'static,
  B: HostBridge,
{
  pub fn new(config: &Config, cache_store: S, queue_store: Q, fetcher: F, bridge: B) -> Result<Self> {
    let origin = config.origin_url()?;
    let registry = Arc::new(Registry::new(cache_store));
    let fetcher = Arc::new(fetcher);
    let bridge = Arc::new(bridge);

    let queue = Arc::new(OfflineQueue::new(
      queue_store,
      QueueConfig {
        max_attempts: config.queue.max_attempts,
        backoff_base: std::time::Duration::from_millis(config.queue.backoff_base_ms),
        backoff_cap: std::time::Duration::from_millis(config.queue.backoff_cap_ms),
        wake_tag: config.queue.wake_tag.clone(),
      },
    ));

    let populator = Populator::new(Arc::clone(&fetcher), origin.clone());
    let interceptor = Arc::new(Interceptor::new(
      Arc::clone(&registry),
      Arc::clone(&fetcher),
      origin,
      &config.cache.offline_fallback,
      config.fetch_timeout(),
      config.slow_fetch_warn(),
    )?);
    let dispatcher = Dispatcher::new(Arc::clone(&bridge), config.notification_title());

    Ok(Self {
      state: WorkerState::Idle,
      version: config.cache.version.clone(),
      manifest: config.cache.manifest.clone(),
      registry,
      queue,
      fetcher,
      populator,
      interceptor,
      dispatcher,
      bridge,
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn registry(&self) -> &Arc<Registry<S>> {
    &self.registry
  }

  pub fn queue(&self) -> &Arc<OfflineQueue<Q>> {
    &self.queue
  }

  /// Dispatch one host event; the host awaits completion before it
  /// considers the lifecycle phase finished.
  pub async fn handle(&mut self, event: HostEvent) -> Result<()> {
    match event {
      HostEvent::Install => self.install().await,
      HostEvent::Activate => self.activate().await,
      HostEvent::Fetch { request, reply } => {
        self.serve(request, reply);
        Ok(())
      }
      HostEvent::Wake { tag } => self.wake(&tag).await,
      HostEvent::Push { payload } => {
        self.dispatcher.on_push(payload.as_deref());
        Ok(())
      }
      HostEvent::NotificationInteraction { action, target } => {
        self.dispatcher.on_interaction(action, &target);
        Ok(())
      }
      HostEvent::Broadcast { command } => {
        self.dispatcher.on_broadcast(&command);
        Ok(())
      }
    }
  }

  /// Drive the worker from a host event channel.
  pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<HostEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
      if let Err(e) = self.handle(event).await {
        error!("event handling failed: {}", e);
      }
    }

    Ok(())
  }

  /// Install the configured manifest into a new static generation.
  async fn install(&mut self) -> Result<()> {
    self
      .populator
      .install(&self.registry, &self.manifest, &self.version)
      .await?;

    self.state = WorkerState::Installed;
    // Eligible to take over immediately; sessions may transiently mix old
    // and new assets until they reload
    self.bridge.take_over_immediately();

    Ok(())
  }

  /// Activate the installed generation pair and retire everything else.
  async fn activate(&mut self) -> Result<()> {
    let static_id = GenerationId::new_static(&self.version);
    let dynamic_id = GenerationId::new_dynamic(&self.version);

    if self.registry.store().count(&static_id.name())? == 0 {
      return Err(eyre!(
        "Cannot activate {}: no installed static generation",
        static_id
      ));
    }

    self.registry.activate(&static_id, &dynamic_id)?;

    // Reaping must finish before the worker announces itself ready, so a
    // new session's read can never race the delete of its generation
    reap(&self.registry, &[static_id, dynamic_id]).await?;

    self.state = WorkerState::Active;
    info!(version = %self.version, "worker active");
    self.bridge.claim_active_sessions();

    Ok(())
  }

  /// Serve one intercepted request as an independent task.
  fn serve(
    &self,
    request: crate::origin::Request,
    reply: tokio::sync::oneshot::Sender<Result<crate::origin::Response>>,
  ) {
    if self.state == WorkerState::Active {
      let interceptor = Arc::clone(&self.interceptor);
      tokio::spawn(async move {
        let result = interceptor.intercept(request).await;
        let _ = reply.send(result);
      });
    } else {
      // Not serving yet: pass straight through to the network
      let fetcher = Arc::clone(&self.fetcher);
      tokio::spawn(async move {
        let result = fetcher.fetch(&request).await;
        let _ = reply.send(result);
      });
    }
  }

  /// Replay the offline write queue on a wake signal.
  async fn wake(&self, tag: &str) -> Result<()> {
    if tag != self.queue.wake_tag() {
      debug!(tag = %tag, "ignoring wake for unknown tag");
      return Ok(());
    }

    let report = self.queue.replay(self.fetcher.as_ref()).await?;

    if !report.failed.is_empty() {
      warn!(
        failed = report.failed.len(),
        "deferred writes exhausted their attempt budget"
      );
    }
    if report.has_deferred() {
      // Wake signals are one-shot; ask for another for the retries
      self.bridge.register_wake(self.queue.wake_tag());
    }

    Ok(())
  }

  /// UI-layer collaborator interface: queue a write whose delivery to the
  /// origin failed. Returns the queue id.
  pub fn submit_deferred_write(&self, payload: Vec<u8>, idempotency_key: &str) -> Result<String> {
    let id = self.queue.enqueue(payload, idempotency_key)?;
    self.bridge.register_wake(self.queue.wake_tag());

    Ok(id)
  }

  /// Writes that exhausted their attempt budget, for the application layer.
  pub fn failed_writes(&self) -> Result<Vec<QueuedWrite>> {
    self.queue.failed()
  }
}
