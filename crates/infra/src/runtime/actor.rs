use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::ActorError;
use crate::event_store::EventStore;

use super::{Entity, EntityCell};

/// Sends needed before giving up on an actor that keeps stopping under us.
const MAX_DELIVERIES: usize = 4;

struct Envelope<E: Entity> {
    request: E::Request,
    reply: oneshot::Sender<Reply<E>>,
}

enum Reply<E: Entity> {
    Done(Result<E::Response, ActorError>),
    /// The actor retired before reaching this request; send it again.
    Redeliver(E::Request),
}

struct Mailbox<E: Entity> {
    tx: mpsc::Sender<Envelope<E>>,
    generation: u64,
}

impl<E: Entity> Clone for Mailbox<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            generation: self.generation,
        }
    }
}

type Registry<E> = Arc<Mutex<HashMap<<E as Entity>::Key, Mailbox<E>>>>;

/// Hosts every live actor of one entity kind.
pub struct ActorRuntime<E: Entity> {
    entity: Arc<E>,
    store: Arc<dyn EventStore>,
    config: RuntimeConfig,
    registry: Registry<E>,
    generations: AtomicU64,
    /// Flipped once by `shutdown`; read under the registry lock.
    stop: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl<E: Entity> core::fmt::Debug for ActorRuntime<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActorRuntime")
            .field("kind", &E::KIND)
            .field("config", &self.config)
            .field("live_actors", &self.live_actors())
            .finish()
    }
}

impl<E: Entity> ActorRuntime<E> {
    pub fn new(entity: E, store: Arc<dyn EventStore>, config: RuntimeConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            entity: Arc::new(entity),
            store,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(1),
            stop,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn live_actors(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_live(&self, key: &E::Key) -> bool {
        self.registry
            .lock()
            .map(|r| r.contains_key(key))
            .unwrap_or(false)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop every actor and wait for them to finish.
    ///
    /// Requests already queued are served first. Afterwards the runtime
    /// refuses new work with `ActorError::Unavailable`; it cannot be restarted.
    pub async fn shutdown(&self) {
        if let Ok(mut registry) = self.registry.lock() {
            self.stop.send_replace(true);
            registry.clear();
        }
        let mut tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        let stopping = tasks.len();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(entity = E::KIND, error = %err, "actor task ended abnormally");
            }
        }
        info!(entity = E::KIND, stopping, "runtime shut down");
    }

    /// Send `request` to the actor for `key` and wait for its reply.
    ///
    /// The actor is spawned (and rehydrated) if it is not live. The whole call,
    /// delivery included, is bounded by the configured call timeout.
    pub async fn ask(&self, key: E::Key, request: E::Request) -> Result<E::Response, ActorError> {
        let deadline = Instant::now() + self.config.call_timeout();
        let mut request = request;

        for _ in 0..MAX_DELIVERIES {
            let mailbox = self.mailbox(key)?;
            let (reply_tx, reply_rx) = oneshot::channel();
            let envelope = Envelope {
                request,
                reply: reply_tx,
            };

            match timeout_at(deadline, mailbox.tx.send(envelope)).await {
                Err(_) => return Err(self.timeout_error(&key)),
                Ok(Err(mpsc::error::SendError(returned))) => {
                    // The actor stopped between lookup and send.
                    self.forget(&key, mailbox.generation);
                    request = returned.request;
                    continue;
                }
                Ok(Ok(())) => {}
            }

            match timeout_at(deadline, reply_rx).await {
                Err(_) => return Err(self.timeout_error(&key)),
                Ok(Err(_)) => {
                    return Err(ActorError::Unavailable(format!(
                        "{} {key} stopped while serving the request",
                        E::KIND
                    )));
                }
                Ok(Ok(Reply::Done(result))) => return result,
                Ok(Ok(Reply::Redeliver(returned))) => {
                    debug!(entity = E::KIND, %key, "request redelivered after eviction");
                    request = returned;
                }
            }
        }

        Err(ActorError::Unavailable(format!(
            "{} {key} could not be reached",
            E::KIND
        )))
    }

    fn timeout_error(&self, key: &E::Key) -> ActorError {
        ActorError::Timeout {
            entity: E::KIND,
            key: key.to_string(),
            timeout_ms: self.config.call_timeout_ms,
        }
    }

    fn mailbox(&self, key: E::Key) -> Result<Mailbox<E>, ActorError> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| ActorError::Unavailable("actor registry lock poisoned".to_string()))?;

        if *self.stop.borrow() {
            return Err(ActorError::Unavailable(format!(
                "{} runtime is shut down",
                E::KIND
            )));
        }

        if let Some(existing) = registry.get(&key) {
            if !existing.tx.is_closed() {
                return Ok(existing.clone());
            }
        }

        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mailbox = Mailbox { tx, generation };
        registry.insert(key, mailbox.clone());

        let task = ActorTask {
            entity: self.entity.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            key,
            generation,
            idle_timeout: self.config.idle_timeout(),
        };
        // Spawned under the registry lock so `shutdown` either refuses this
        // activation or waits for it.
        if let Ok(mut tasks) = self.tasks.lock() {
            while tasks.try_join_next().is_some() {}
            tasks.spawn(task.run(rx, self.stop.subscribe()));
        }
        drop(registry);
        info!(entity = E::KIND, %key, generation, "actor spawned");

        Ok(mailbox)
    }

    fn forget(&self, key: &E::Key, generation: u64) {
        if let Ok(mut registry) = self.registry.lock() {
            if registry.get(key).is_some_and(|m| m.generation == generation) {
                registry.remove(key);
            }
        }
    }
}

struct ActorTask<E: Entity> {
    entity: Arc<E>,
    store: Arc<dyn EventStore>,
    registry: Registry<E>,
    key: E::Key,
    generation: u64,
    idle_timeout: Duration,
}

impl<E: Entity> ActorTask<E> {
    async fn run(self, mut rx: mpsc::Receiver<Envelope<E>>, mut stop: watch::Receiver<bool>) {
        let key = self.key;
        let loaded = EntityCell::load(
            self.store.clone(),
            E::tenant_id(&key),
            E::stream_id(&key),
            E::KIND,
            E::empty(&key),
        );
        let mut cell = match loaded {
            Ok(cell) => cell,
            Err(err) => {
                warn!(entity = E::KIND, %key, error = %err, "actor failed to load");
                self.retire(&mut rx);
                while let Ok(envelope) = rx.try_recv() {
                    let _ = envelope.reply.send(Reply::Done(Err(err.clone())));
                }
                return;
            }
        };

        loop {
            let received = tokio::select! {
                biased;
                _ = stop.changed() => {
                    rx.close();
                    while let Some(envelope) = rx.recv().await {
                        self.serve(&mut cell, envelope).await;
                    }
                    self.retire(&mut rx);
                    debug!(entity = E::KIND, %key, "actor stopped by shutdown");
                    break;
                }
                received = timeout(self.idle_timeout, rx.recv()) => received,
            };
            match received {
                Ok(Some(envelope)) => self.serve(&mut cell, envelope).await,
                Ok(None) => {
                    debug!(entity = E::KIND, %key, "mailbox closed, actor stopping");
                    break;
                }
                Err(_) => {
                    self.retire(&mut rx);
                    // Requests that raced with eviction go to the next activation.
                    while let Ok(envelope) = rx.try_recv() {
                        let _ = envelope.reply.send(Reply::Redeliver(envelope.request));
                    }
                    info!(
                        entity = E::KIND,
                        %key,
                        revision = cell.revision(),
                        "actor evicted after idle timeout"
                    );
                    break;
                }
            }
        }
    }

    async fn serve(&self, cell: &mut EntityCell<E::Aggregate>, envelope: Envelope<E>) {
        let key = self.key;
        debug!(entity = E::KIND, %key, request = ?envelope.request, "request received");
        let result = self.entity.receive(cell, envelope.request).await;
        if let Err(err) = &result {
            debug!(entity = E::KIND, %key, error = %err, "request failed");
        }
        // The caller may have stopped waiting.
        let _ = envelope.reply.send(Reply::Done(result));
    }

    /// Unregister this activation and refuse further sends.
    fn retire(&self, rx: &mut mpsc::Receiver<Envelope<E>>) {
        if let Ok(mut registry) = self.registry.lock() {
            if registry
                .get(&self.key)
                .is_some_and(|m| m.generation == self.generation)
            {
                registry.remove(&self.key);
            }
        }
        rx.close();
    }
}
