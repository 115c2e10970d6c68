//! Per-entity single-writer actors
//!
//! Every entity instance is owned by exactly one Tokio task:
//! - Commands for one entity are strictly serialized through its mailbox
//! - Different entities run in parallel
//! - State is rebuilt from the journal before the first command is served
//! - An idle actor leaves its registry and stops; the next command respawns it
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        Relays / Ledger facade (many tasks)           │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ EntityHandle<E> (Clone)
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              EntityActor<E> (Single Task)            │
//! │   decide ─► Journal::append ─► evolve ─► publish     │
//! └──────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::TreeConfig;
use crate::entity::{Entity, EntityKey, EventSink, PublishedEvent};
use crate::metrics::Metrics;
use crate::storage::{Journal, StoredRecord};
use crate::{Error, Result};

/// Collaborators shared by every actor of a runtime
pub struct ActorContext {
    /// Event journal
    pub journal: Arc<dyn Journal>,
    /// Relay input
    pub sink: Arc<dyn EventSink>,
    /// Tree shape parameters
    pub tree: TreeConfig,
    /// Runtime metrics
    pub metrics: Metrics,
    /// Idle time after which a registered actor passivates
    pub idle_timeout: Option<Duration>,
}

impl std::fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContext")
            .field("tree", &self.tree)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Live handles of one entity kind, keyed by entity id
pub type Directory<E> = DashMap<<E as Entity>::Id, EntityHandle<E>>;

/// Message sent to an entity actor
pub enum EntityMessage<E: Entity> {
    /// Run one command
    Execute {
        command: E::Command,
        response: oneshot::Sender<Result<Vec<E::Event>>>,
    },

    /// Snapshot of the current state
    GetState {
        response: oneshot::Sender<E>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Journal key of an entity
pub fn journal_key<E: Entity>(id: &E::Id) -> String {
    format!("{}/{}", E::KIND, id.entity_id())
}

/// Actor owning one entity
pub struct EntityActor<E: Entity> {
    id: E::Id,
    key: String,
    state: E,
    head: u64,
    ctx: Arc<ActorContext>,
    mailbox: mpsc::Receiver<EntityMessage<E>>,
    directory: Option<Arc<Directory<E>>>,
}

impl<E: Entity> EntityActor<E> {
    fn new(id: E::Id, ctx: Arc<ActorContext>, mailbox_capacity: usize) -> (Self, EntityHandle<E>) {
        let (sender, mailbox) = mpsc::channel(mailbox_capacity.max(1));
        let actor = Self {
            key: journal_key::<E>(&id),
            id,
            state: E::default(),
            head: 0,
            ctx,
            mailbox,
            directory: None,
        };
        (
            actor,
            EntityHandle {
                sender,
                lease: Arc::new(()),
            },
        )
    }

    /// Spawn the actor for `id` and return its handle; it runs until shut down
    pub fn spawn(id: E::Id, ctx: Arc<ActorContext>, mailbox_capacity: usize) -> EntityHandle<E> {
        let (actor, handle) = Self::new(id, ctx, mailbox_capacity);
        tokio::spawn(actor.run());
        handle
    }

    /// Spawn an actor listed in `directory`. Once idle for the context's
    /// timeout it removes its own entry and stops.
    pub fn spawn_listed(
        id: E::Id,
        ctx: Arc<ActorContext>,
        mailbox_capacity: usize,
        directory: Arc<Directory<E>>,
    ) -> EntityHandle<E> {
        let (mut actor, handle) = Self::new(id, ctx, mailbox_capacity);
        actor.directory = Some(directory);
        tokio::spawn(actor.run());
        handle
    }

    /// Replay the journal, then serve the mailbox until shutdown or passivation
    pub async fn run(mut self) {
        if let Err(e) = self.replay() {
            // Dropping the mailbox closes the handle; the registry respawns on next use
            tracing::error!(entity = %self.key, error = %e, "Journal replay failed");
            return;
        }
        self.ctx.metrics.actors_active.inc();

        while let Some(msg) = self.next_message().await {
            match msg {
                EntityMessage::Execute { command, response } => {
                    let result = self.execute(command);
                    let _ = response.send(result);
                }
                EntityMessage::GetState { response } => {
                    let _ = response.send(self.state.clone());
                }
                EntityMessage::Shutdown => break,
            }
        }

        self.ctx.metrics.actors_active.dec();
        tracing::debug!(entity = %self.key, head = self.head, "Actor stopped");
    }

    async fn next_message(&mut self) -> Option<EntityMessage<E>> {
        let idle = match (self.ctx.idle_timeout, &self.directory) {
            (Some(idle), Some(_)) => idle,
            _ => return self.mailbox.recv().await,
        };
        loop {
            match tokio::time::timeout(idle, self.mailbox.recv()).await {
                Ok(msg) => return msg,
                Err(_) => match self.try_passivate() {
                    Passivation::Done => return None,
                    Passivation::Pending(msg) => return Some(msg),
                    Passivation::InUse => continue,
                },
            }
        }
    }

    /// Leave the directory if nobody else holds a handle and nothing is queued.
    /// Handles are cloned out of the directory under its shard lock, so once the
    /// entry is gone no new message can reach this mailbox.
    fn try_passivate(&mut self) -> Passivation<E> {
        let Some(directory) = &self.directory else {
            return Passivation::InUse;
        };
        let mailbox = &mut self.mailbox;
        let mut pending = None;
        let removed = directory.remove_if(&self.id, |_, handle| {
            if handle.in_use() {
                return false;
            }
            match mailbox.try_recv() {
                Ok(msg) => {
                    pending = Some(msg);
                    false
                }
                Err(_) => true,
            }
        });

        match (removed, pending) {
            (Some(_), _) => {
                self.ctx.metrics.passivations_total.inc();
                tracing::debug!(entity = %self.key, head = self.head, "Actor passivated");
                Passivation::Done
            }
            (None, Some(msg)) => Passivation::Pending(msg),
            (None, None) => Passivation::InUse,
        }
    }

    fn replay(&mut self) -> Result<()> {
        let records = self.ctx.journal.load(&self.key)?;
        if records.is_empty() {
            return Ok(());
        }
        for record in &records {
            let event: E::Event = bincode::deserialize(&record.payload)?;
            self.state.evolve(&event, record.recorded_at);
            self.head = record.seq;
        }
        self.ctx.metrics.record_replay();
        tracing::debug!(entity = %self.key, events = records.len(), "Replayed journal");
        Ok(())
    }

    fn execute(&mut self, command: E::Command) -> Result<Vec<E::Event>> {
        let _timer = self.ctx.metrics.command_duration.start_timer();

        let events = match self.state.decide(&self.id, &command, &self.ctx.tree) {
            Ok(events) => events,
            Err(e) => {
                self.ctx.metrics.record_rejection(E::KIND);
                tracing::debug!(entity = %self.key, ?command, error = %e, "Command rejected");
                return Err(e);
            }
        };
        if events.is_empty() {
            self.ctx.metrics.record_command(E::KIND, 0);
            return Ok(events);
        }

        let recorded_at = Utc::now();
        let records = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                Ok(StoredRecord {
                    seq: self.head + 1 + i as u64,
                    recorded_at,
                    payload: bincode::serialize(event)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.ctx.journal.append(&self.key, &records)?;

        let entity_id = self.id.entity_id();
        for (event, record) in events.iter().zip(&records) {
            self.state.evolve(event, recorded_at);
            self.head = record.seq;
            self.ctx.sink.publish(PublishedEvent {
                kind: E::KIND.to_string(),
                entity_id: entity_id.clone(),
                seq: record.seq,
                recorded_at,
                event: event.clone().into(),
            });
        }

        self.ctx.metrics.record_command(E::KIND, events.len());
        tracing::debug!(entity = %self.key, head = self.head, events = events.len(), "Command applied");
        Ok(events)
    }
}

enum Passivation<E: Entity> {
    Done,
    Pending(EntityMessage<E>),
    InUse,
}

/// Handle for sending messages to an entity actor
pub struct EntityHandle<E: Entity> {
    sender: mpsc::Sender<EntityMessage<E>>,
    // counts live clones; the directory's own copy is one
    lease: Arc<()>,
}

impl<E: Entity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            lease: self.lease.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("kind", &E::KIND)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<E: Entity> EntityHandle<E> {
    /// Run a command, returning the events it journaled
    pub async fn execute(&self, command: E::Command) -> Result<Vec<E::Event>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(EntityMessage::Execute {
                command,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency(format!("{} actor mailbox closed", E::KIND)))?;

        rx.await
            .map_err(|_| Error::Concurrency(format!("{} actor dropped response", E::KIND)))?
    }

    /// Current state
    pub async fn state(&self) -> Result<E> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(EntityMessage::GetState { response: tx })
            .await
            .map_err(|_| Error::Concurrency(format!("{} actor mailbox closed", E::KIND)))?;

        rx.await
            .map_err(|_| Error::Concurrency(format!("{} actor dropped response", E::KIND)))
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(EntityMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency(format!("{} actor mailbox closed", E::KIND)))?;
        Ok(())
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn in_use(&self) -> bool {
        Arc::strong_count(&self.lease) > 1
    }
}
