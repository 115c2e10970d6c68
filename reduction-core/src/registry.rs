//! Lazily spawned actors, one per entity key
//!
//! Actors passivate themselves after the runtime's idle timeout, so the
//! registry only holds entities that were used recently.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;

use crate::actor::{ActorContext, Directory, EntityActor, EntityHandle};
use crate::entity::Entity;
use crate::Result;

/// Actors of one entity kind
pub struct EntityRegistry<E: Entity> {
    actors: Arc<Directory<E>>,
    ctx: Arc<ActorContext>,
    mailbox_capacity: usize,
}

impl<E: Entity> std::fmt::Debug for EntityRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("kind", &E::KIND)
            .field("actors", &self.actors.len())
            .finish()
    }
}

impl<E: Entity> EntityRegistry<E> {
    /// Empty registry
    pub fn new(ctx: Arc<ActorContext>, mailbox_capacity: usize) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            ctx,
            mailbox_capacity,
        }
    }

    /// Handle for `id`, spawning (or respawning) its actor when needed
    pub fn handle(&self, id: &E::Id) -> EntityHandle<E> {
        match self.actors.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    tracing::warn!(kind = E::KIND, entity = %id, "Respawning stopped actor");
                    let handle = self.spawn(id);
                    entry.insert(handle.clone());
                    handle
                } else {
                    entry.get().clone()
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(id);
                entry.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn(&self, id: &E::Id) -> EntityHandle<E> {
        EntityActor::<E>::spawn_listed(
            id.clone(),
            self.ctx.clone(),
            self.mailbox_capacity,
            self.actors.clone(),
        )
    }

    /// Run a command on `id`
    pub async fn execute(&self, id: &E::Id, command: E::Command) -> Result<Vec<E::Event>> {
        self.handle(id).execute(command).await
    }

    /// Current state of `id` (default state if it was never created)
    pub async fn state(&self, id: &E::Id) -> Result<E> {
        self.handle(id).state().await
    }

    /// Number of live actors
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Whether no actor is live
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Stop every actor
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.actors.iter().map(|e| e.value().clone()).collect();
        join_all(handles.iter().map(|h| h.shutdown())).await;
        self.actors.clear();
    }
}
