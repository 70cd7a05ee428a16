//! SyncEngine — keeps one agent consistent with the control plane.
//!
//! ```text
//!            ┌── watch loop ──────┐ (reconnect, linear backoff)
//!            ├── pull loop ───────┤ (full resync every pull_interval)
//!  control   ├── reconcile loop ──┤ (per local workload lookup)      inbound    router ──▶ controllers
//!  plane ────┤                    ├──────────────────────────────▶  buffer ───▶          ──▶ orchestrator
//!            ├── refresh loop ────┘ (per controller)                                        │
//!            └◀─ push loop ◀── outbound buffer ◀── Reporter ◀───────────────────────────────┘
//!                 (breaker(retry(report)))
//! ```
//!
//! Every loop exits when the shutdown channel flips, abandoning whatever
//! call it has in flight. A full pull is also bounded by `pull_timeout`
//! per attempt, so a stalled stream cannot hold the loop. None of them share
//! ordering guarantees, so controllers treat every event as a replayable
//! assertion.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use keel_sync::{
    AgentIdentity, BufferConfig, ControlPlane, EventBuffer, InfraEvent, StatusUpdate, SyncError,
    Transient,
};

use crate::controller::Router;
use crate::error::{AgentError, AgentResult};
use crate::orchestrator::Orchestrator;
use crate::reconciler::Reconciler;
use crate::reporter::Reporter;
use crate::resilience::{Backoff, BreakerConfig, BreakerError, CircuitBreaker, RetryPolicy};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pull_interval: Duration,
    /// Bound on one full-pull attempt, stream drained included.
    pub pull_timeout: Duration,
    pub reconcile_interval: Duration,
    pub refresh_interval: Duration,
    pub watch_backoff: Backoff,
    pub pull_retry: RetryPolicy,
    pub push_retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub inbound: BufferConfig,
    pub outbound: BufferConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pull_interval: Duration::from_secs(15 * 60),
            pull_timeout: Duration::from_secs(2 * 60),
            reconcile_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(5 * 60),
            watch_backoff: Backoff::Linear {
                step: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            pull_retry: RetryPolicy::default(),
            push_retry: RetryPolicy::default().with_max_attempts(3),
            breaker: BreakerConfig::default(),
            inbound: BufferConfig::default(),
            outbound: BufferConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_watch_backoff(mut self, backoff: Backoff) -> Self {
        self.watch_backoff = backoff;
        self
    }

    pub fn with_pull_retry(mut self, retry: RetryPolicy) -> Self {
        self.pull_retry = retry;
        self
    }

    pub fn with_push_retry(mut self, retry: RetryPolicy) -> Self {
        self.push_retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_inbound(mut self, inbound: BufferConfig) -> Self {
        self.inbound = inbound;
        self
    }

    pub fn with_outbound(mut self, outbound: BufferConfig) -> Self {
        self.outbound = outbound;
        self
    }
}

pub struct SyncEngine {
    plane: Arc<dyn ControlPlane>,
    identity: AgentIdentity,
    config: EngineConfig,
    inbound: Arc<EventBuffer<InfraEvent>>,
    reporter: Reporter,
    reconciler: Arc<Reconciler>,
    router: Router,
    breaker: CircuitBreaker,
}

impl SyncEngine {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        identity: AgentIdentity,
        orchestrator: Arc<dyn Orchestrator>,
        config: EngineConfig,
    ) -> Self {
        let reporter = Reporter::new(config.outbound);
        let reconciler = Arc::new(Reconciler::new(
            orchestrator,
            reporter.clone(),
            &identity.region,
        ));
        Self {
            plane,
            inbound: Arc::new(EventBuffer::new(config.inbound)),
            router: Router::new(reconciler.clone()),
            breaker: CircuitBreaker::new("control-plane-push", config.breaker),
            reconciler,
            reporter,
            identity,
            config,
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Events waiting for the router.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    fn enqueue(&self, event: InfraEvent) {
        if let Some(dropped) = self.inbound.push(event) {
            warn!(
                kind = %dropped.kind(),
                id = %dropped.resource_id(),
                "inbound buffer full, event dropped"
            );
        }
    }

    /// Run every loop until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            client_id = %self.identity.client_id,
            region = %self.identity.region,
            shard = %self.identity.shard,
            "sync engine starting"
        );
        tokio::join!(
            self.watch_loop(shutdown.clone()),
            self.pull_loop(shutdown.clone()),
            self.push_loop(shutdown.clone()),
            self.reconcile_loop(shutdown.clone()),
            self.refresh_loop(shutdown.clone()),
            self.route_loop(shutdown),
        );
        info!(client_id = %self.identity.client_id, "sync engine stopped");
    }

    // ── Watch ──────────────────────────────────────────────────────

    async fn watch_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        while !*shutdown.borrow() {
            let opened = tokio::select! {
                opened = self.plane.watch(&self.identity) => opened,
                _ = shutdown.changed() => break,
            };
            match opened {
                Ok(mut events) => {
                    info!(client_id = %self.identity.client_id, "watch stream established");
                    attempt = 0;
                    loop {
                        tokio::select! {
                            item = events.next() => match item {
                                Some(Ok(event)) => {
                                    debug!(kind = %event.kind(), id = %event.resource_id(), "watch event received");
                                    self.enqueue(event);
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "watch stream failed");
                                    break;
                                }
                                None => {
                                    warn!("watch stream closed by control plane");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) => warn!(error = %e, attempt, "watch connect failed"),
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.watch_backoff.delay(attempt);
            debug!(?delay, attempt, "reconnecting watch");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("watch loop stopped");
    }

    // ── Pull ───────────────────────────────────────────────────────

    /// Fetch the full desired state and queue every event.
    pub async fn pull_once(&self) -> AgentResult<usize> {
        let events = self
            .config
            .pull_retry
            .run(|| async {
                let collect = async {
                    let mut stream = self.plane.desired_state(&self.identity).await?;
                    let mut events = Vec::new();
                    while let Some(item) = stream.next().await {
                        events.push(item?);
                    }
                    Ok::<_, SyncError>(events)
                };
                match tokio::time::timeout(self.config.pull_timeout, collect).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::DeadlineExceeded(format!(
                        "full pull did not finish within {:?}",
                        self.config.pull_timeout
                    ))),
                }
            })
            .await?;
        let count = events.len();
        for event in events {
            self.enqueue(event);
        }
        info!(count, "full desired state pulled");
        Ok(count)
    }

    async fn pull_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => tokio::select! {
                    result = self.pull_once() => if let Err(e) = result {
                        error!(error = %e, "full resync failed");
                    },
                    _ = shutdown.changed() => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("pull loop stopped");
    }

    // ── Push ───────────────────────────────────────────────────────

    /// Send one update through the breaker and retry decorators.
    pub async fn push_once(&self, update: StatusUpdate) -> Result<(), BreakerError<SyncError>> {
        self.breaker
            .call(|| {
                self.config
                    .push_retry
                    .run(|| self.plane.report(&self.identity, update.clone()))
            })
            .await
    }

    async fn push_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.reporter.queue().clone();
        let mut pending: Option<StatusUpdate> = None;
        loop {
            let update = match pending.take() {
                Some(update) => update,
                None => tokio::select! {
                    update = queue.pop() => update,
                    _ = shutdown.changed() => break,
                },
            };
            let pushed = tokio::select! {
                pushed = self.push_once(update.clone()) => pushed,
                _ = shutdown.changed() => {
                    debug!(?update, "shutdown during push, update not sent");
                    break;
                }
            };
            match pushed {
                Ok(()) => debug!("status update pushed"),
                Err(BreakerError::Open { retry_after }) => {
                    debug!(?retry_after, "control plane circuit open, holding update");
                    pending = Some(update);
                    tokio::select! {
                        _ = tokio::time::sleep(retry_after) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(BreakerError::Inner(e)) if e.is_transient() => {
                    warn!(error = %e, "status push failed, will retry");
                    pending = Some(update);
                }
                Err(BreakerError::Inner(e)) => {
                    warn!(error = %e, ?update, "status update rejected, dropping");
                }
            }
        }
        debug!(unsent = queue.len(), "push loop stopped");
    }

    // ── Reconcile / refresh ────────────────────────────────────────

    /// Re-ask the control plane about every workload running locally.
    pub async fn reconcile_once(&self) -> AgentResult<usize> {
        self.reconciler
            .resync_local(self.plane.as_ref(), &self.identity, None, &self.inbound)
            .await
    }

    async fn reconcile_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tokio::select! {
                    result = self.reconcile_once() => if let Err(e) = result {
                        warn!(error = %e, "reconcile pass failed");
                    },
                    _ = shutdown.changed() => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("reconcile loop stopped");
    }

    /// Run every controller's periodic refresh once.
    pub async fn refresh_once(&self) -> AgentResult<usize> {
        let mut queued = 0;
        for controller in self.router.controllers() {
            queued += controller
                .refresh(self.plane.as_ref(), &self.identity, &self.inbound)
                .await?;
        }
        Ok(queued)
    }

    async fn refresh_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tokio::select! {
                    result = self.refresh_once() => if let Err(e) = result {
                        warn!(error = %e, "controller refresh failed");
                    },
                    _ = shutdown.changed() => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("refresh loop stopped");
    }

    // ── Route ──────────────────────────────────────────────────────

    /// Dispatch everything currently buffered. Returns how many events were handled.
    pub async fn drain_inbound(&self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.inbound.try_pop() {
            self.route(event).await;
            handled += 1;
        }
        handled
    }

    async fn route(&self, event: InfraEvent) {
        let kind = event.kind();
        let id = event.resource_id().to_string();
        if let Err(e) = self.router.dispatch(event).await {
            match e {
                AgentError::Validation(_) | AgentError::WrongKind { .. } => {
                    warn!(%kind, %id, error = %e, "event rejected")
                }
                _ => error!(%kind, %id, error = %e, "event handling failed"),
            }
        }
    }

    async fn route_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                event = self.inbound.pop() => event,
                _ = shutdown.changed() => break,
            };
            tokio::select! {
                _ = self.route(event) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("route loop stopped");
    }
}
