//! Event dispatcher
//!
//! Drains the runtime's event stream, keeps the shard index current, and
//! delivers every derived command with retry on a per-entity lane. A lane
//! exists only while its entity has commands queued. Outcomes fan out over a
//! broadcast channel. A shared backlog counts events not yet routed plus
//! deliveries not yet settled, so callers can wait for the cascade to go
//! quiet.

use parking_lot::Mutex;
use rand::thread_rng;
use reduction_core::reduction::AggregationShape;
use reduction_core::{Command, DomainEvent, EventSink, PublishedEvent, Runtime};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dlq::DeadLetterQueue;
use crate::index::ShardIndex;
use crate::message::{Directive, Outcome};
use crate::retry::{DeliveryFailure, RetryPolicy};
use crate::routes::{derive, RouteContext};
use crate::watermark::{Receipt, RelayWatermarks};

/// Work in flight between the runtime and its relays
#[derive(Debug, Default)]
pub struct Backlog {
    pending: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    /// Empty backlog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` units of work
    pub fn add(&self, n: usize) {
        let now = self.pending.fetch_add(n, Ordering::SeqCst) + n;
        crate::metrics::BACKLOG.set(now as i64);
    }

    /// Settle `n` units of work
    pub fn done(&self, n: usize) {
        let now = self.pending.fetch_sub(n, Ordering::SeqCst) - n;
        crate::metrics::BACKLOG.set(now as i64);
        if now == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Units in flight
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is in flight
    pub async fn wait_idle(&self) {
        loop {
            // registered before the check so a concurrent `done` cannot slip between
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Runtime event sink feeding the dispatcher
#[derive(Debug)]
pub struct RelaySink {
    tx: mpsc::UnboundedSender<PublishedEvent>,
    backlog: Arc<Backlog>,
}

impl RelaySink {
    /// Sink paired with the dispatcher's receiving end
    pub fn channel(backlog: Arc<Backlog>) -> (Self, mpsc::UnboundedReceiver<PublishedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, backlog }, rx)
    }
}

impl EventSink for RelaySink {
    fn publish(&self, event: PublishedEvent) {
        self.backlog.add(1);
        if let Err(e) = self.tx.send(event) {
            self.backlog.done(1);
            warn!(
                entity_id = %e.0.entity_id,
                seq = e.0.seq,
                "Dispatcher stopped, event not relayed"
            );
        }
    }
}

/// One command on its way to a target entity
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Command to dispatch
    pub command: Command,
    /// Event that derived it (`kind/entity_id#seq`)
    pub origin: String,
    /// Settles the originating event once delivery finishes
    pub receipt: Option<Receipt>,
}

/// Routes published events to derived commands and outcomes
#[derive(Debug, Clone)]
pub struct Dispatcher {
    runtime: Arc<Runtime>,
    index: Arc<ShardIndex>,
    dlq: Arc<DeadLetterQueue>,
    backlog: Arc<Backlog>,
    outcomes: broadcast::Sender<Outcome>,
    retry: RetryPolicy,
    shape: AggregationShape,
    discovery_limit: usize,
    watermarks: Arc<RelayWatermarks>,
    lanes: Arc<Mutex<HashMap<String, VecDeque<Delivery>>>>,
    stopped: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Dispatcher over a runtime whose sink is a [`RelaySink`] sharing `backlog`
    pub fn new(
        runtime: Arc<Runtime>,
        index: Arc<ShardIndex>,
        dlq: Arc<DeadLetterQueue>,
        backlog: Arc<Backlog>,
        outcomes: broadcast::Sender<Outcome>,
        retry: RetryPolicy,
        discovery_limit: usize,
    ) -> reduction_core::Result<Self> {
        let shape = runtime.tree().aggregation_shape()?;
        Ok(Self {
            watermarks: Arc::new(RelayWatermarks::new(runtime.clone())),
            runtime,
            index,
            dlq,
            backlog,
            outcomes,
            retry,
            shape,
            discovery_limit,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Consume the event stream until it closes
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<PublishedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(published) = events.recv().await {
                self.route(&published);
                self.backlog.done(1);
            }
            debug!("Event stream closed, dispatcher exiting");
        })
    }

    /// Derive and launch everything one event implies
    pub fn route(&self, published: &PublishedEvent) {
        crate::metrics::EVENTS_ROUTED
            .with_label_values(&[published.event.name()])
            .inc();

        if let DomainEvent::Shard(event) = &published.event {
            self.index.observe(published.seq, event);
        }

        let directives = {
            let mut rng = thread_rng();
            let mut ctx = RouteContext {
                index: &self.index,
                shape: &self.shape,
                discovery_limit: self.discovery_limit,
                rng: &mut rng,
            };
            derive(published, &mut ctx)
        };

        let origin = format!("{}/{}#{}", published.kind, published.entity_id, published.seq);
        let commands = directives
            .iter()
            .filter(|d| matches!(d, Directive::Command(_)))
            .count();
        let receipt = self.watermarks.open(published, commands);
        for directive in directives {
            match directive {
                Directive::Command(command) => self.deliver(Delivery {
                    command,
                    origin: origin.clone(),
                    receipt: Some(receipt.clone()),
                }),
                Directive::Notify(outcome) => self.notify(outcome),
            }
        }
    }

    /// Queue one command on its target's lane, dead-lettering on failure.
    /// Commands to the same entity run in the order they were queued.
    pub fn deliver(&self, delivery: Delivery) {
        self.backlog.add(1);
        let key = format!("{:?}/{}", delivery.command.kind(), delivery.command.target());

        let start_worker = {
            let mut lanes = self.lanes.lock();
            match lanes.get_mut(&key) {
                Some(queue) => {
                    queue.push_back(delivery);
                    false
                }
                None => {
                    lanes.insert(key.clone(), VecDeque::from([delivery]));
                    true
                }
            }
        };
        if start_worker {
            crate::metrics::LANES_OPENED.inc();
            let lane = self.clone();
            tokio::spawn(async move { lane.drain_lane(key).await });
        }
    }

    /// Serve one lane until its queue is empty, then retire it. Pop and
    /// retire happen under the lanes lock, so a concurrent `deliver` either
    /// lands in this queue or opens a fresh lane.
    async fn drain_lane(self, key: String) {
        loop {
            let next = {
                let mut lanes = self.lanes.lock();
                let next = if self.stopped.load(Ordering::SeqCst) {
                    None
                } else {
                    lanes.get_mut(&key).and_then(|queue| queue.pop_front())
                };
                if next.is_none() {
                    // dropped work stays unrelayed and is republished on restart
                    let abandoned = lanes.remove(&key).map_or(0, |queue| queue.len());
                    if abandoned > 0 {
                        self.backlog.done(abandoned);
                    }
                }
                next
            };
            let Some(delivery) = next else {
                return;
            };
            self.run(delivery).await;
            self.backlog.done(1);
        }
    }

    async fn run(&self, delivery: Delivery) {
        let Delivery {
            command,
            origin,
            receipt,
        } = delivery;
        let target = format!("{:?}", command.kind()).to_lowercase();
        let started = Instant::now();
        let result = self
            .retry
            .execute(
                || {
                    let runtime = self.runtime.clone();
                    let command = command.clone();
                    async move { runtime.dispatch(command).await }
                },
                &target,
            )
            .await;

        crate::metrics::DELIVERY_DURATION
            .with_label_values(&[target.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(events) => {
                crate::metrics::DELIVERIES
                    .with_label_values(&[target.as_str(), "delivered"])
                    .inc();
                debug!(%command, %origin, events, "Command delivered");
                if let Some(receipt) = &receipt {
                    self.watermarks.settle(receipt);
                }
            }
            Err(failure) => {
                crate::metrics::DELIVERIES
                    .with_label_values(&[target.as_str(), failure.reason()])
                    .inc();
                // a rejection will not succeed on replay either
                if let (DeliveryFailure::Rejected { .. }, Some(receipt)) = (&failure, &receipt) {
                    self.watermarks.settle(receipt);
                }
                self.dlq.route(command, origin, receipt, &failure);
            }
        }
    }

    /// Lanes with queued or in-flight commands
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Stop taking commands off lanes; queued ones are dropped and their
    /// events stay below the relay watermark
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Relay watermark tracker
    pub fn watermarks(&self) -> &RelayWatermarks {
        &self.watermarks
    }

    fn notify(&self, outcome: Outcome) {
        debug!(?outcome, "Outcome");
        // no subscribers is fine
        let _ = self.outcomes.send(outcome);
    }

    /// Shard discovery index
    pub fn index(&self) -> &Arc<ShardIndex> {
        &self.index
    }
}
