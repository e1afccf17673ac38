//! In-memory host used by the integration tests and the demo binary.
//!
//! Every context keeps its own tick counter. [`SimHost::advance`] steps all
//! of them once on the calling thread (global first, then regions in id
//! order); [`SimHost::advance_context`] steps a single one so tests can run
//! regions at different rates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};

use regiontick_core::{ChunkPos, ContextId, EntityId, Ownership, Target, WorldId};
use tracing::debug;

use crate::host::{Host, TickHook};

#[derive(Default)]
struct World {
    /// Tick counters, global included.
    ticks: BTreeMap<ContextId, u64>,
    worlds: HashSet<WorldId>,
    /// `None` = exists but no region claims it yet.
    entities: HashMap<EntityId, Option<ContextId>>,
    /// Loaded or loading chunks; anything else is out of range.
    chunks: HashMap<(WorldId, ChunkPos), Option<ContextId>>,
}

pub struct SimHost {
    global_model: bool,
    hooks: Mutex<Vec<TickHook>>,
    world: RwLock<World>,
}

impl SimHost {
    /// A host that runs regions on their own clocks.
    pub fn regionized() -> Self {
        Self::new(false)
    }

    /// A host where one global thread owns everything.
    pub fn single_loop() -> Self {
        Self::new(true)
    }

    fn new(global_model: bool) -> Self {
        let mut world = World::default();
        world.ticks.insert(ContextId::GLOBAL, 0);
        Self {
            global_model,
            hooks: Mutex::new(Vec::new()),
            world: RwLock::new(world),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, World> {
        self.world.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, World> {
        self.world.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a region; its clock starts at the global tick.
    pub fn add_region(&self, id: u32) -> ContextId {
        let ctx = ContextId(id);
        let mut world = self.write();
        let start = world.ticks.get(&ContextId::GLOBAL).copied().unwrap_or(0);
        world.ticks.entry(ctx).or_insert(start);
        ctx
    }

    /// Dissolve a region. Whatever it owned stays in the world, unclaimed.
    pub fn remove_region(&self, ctx: ContextId) {
        let mut guard = self.write();
        let world = &mut *guard;
        world.ticks.remove(&ctx);
        for owner in world.entities.values_mut().chain(world.chunks.values_mut()) {
            if *owner == Some(ctx) {
                *owner = None;
            }
        }
        debug!(context = %ctx, "sim region removed");
    }

    pub fn regions(&self) -> Vec<ContextId> {
        self.read()
            .ticks
            .keys()
            .copied()
            .filter(|c| !c.is_global())
            .collect()
    }

    /// A new entity that exists but is not yet in any region.
    pub fn spawn_entity(&self) -> EntityId {
        let id = EntityId::new();
        self.write().entities.insert(id, None);
        id
    }

    /// Put an entity into a region (spawning it if needed).
    pub fn place_entity(&self, id: EntityId, ctx: ContextId) {
        self.write().entities.insert(id, Some(ctx));
    }

    /// Take an entity out of its region; it stays alive but unowned.
    pub fn detach_entity(&self, id: EntityId) {
        if let Some(owner) = self.write().entities.get_mut(&id) {
            *owner = None;
        }
    }

    pub fn despawn_entity(&self, id: EntityId) {
        self.write().entities.remove(&id);
    }

    pub fn add_world(&self, world: impl Into<WorldId>) -> WorldId {
        let world = world.into();
        self.write().worlds.insert(world.clone());
        world
    }

    /// Mark a chunk as loading: it exists but no region runs it yet.
    pub fn loading_chunk(&self, world: &WorldId, chunk: ChunkPos) {
        let mut w = self.write();
        w.worlds.insert(world.clone());
        w.chunks.insert((world.clone(), chunk), None);
    }

    pub fn load_chunk(&self, world: &WorldId, chunk: ChunkPos, ctx: ContextId) {
        let mut w = self.write();
        w.worlds.insert(world.clone());
        w.chunks.insert((world.clone(), chunk), Some(ctx));
    }

    /// Drop a chunk out of the loaded range; targets in it become invalid.
    pub fn unload_chunk(&self, world: &WorldId, chunk: ChunkPos) {
        self.write().chunks.remove(&(world.clone(), chunk));
    }

    /// Step every context once, firing the registered hooks.
    pub fn advance(&self) {
        let stepped: Vec<(ContextId, u64)> = {
            let mut world = self.write();
            world
                .ticks
                .iter_mut()
                .filter(|(ctx, _)| !self.global_model || ctx.is_global())
                .map(|(ctx, tick)| {
                    *tick += 1;
                    (*ctx, *tick)
                })
                .collect()
        };
        for (ctx, tick) in stepped {
            self.fire_hooks(ctx, tick);
        }
    }

    pub fn advance_by(&self, n: u64) {
        for _ in 0..n {
            self.advance();
        }
    }

    /// Step a single context. Unknown contexts are ignored.
    pub fn advance_context(&self, ctx: ContextId) {
        let stepped = {
            let mut world = self.write();
            world.ticks.get_mut(&ctx).map(|tick| {
                *tick += 1;
                *tick
            })
        };
        if let Some(tick) = stepped {
            self.fire_hooks(ctx, tick);
        }
    }

    fn fire_hooks(&self, ctx: ContextId, tick: u64) {
        // Hooks may call back into the host; no lock is held while they run.
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook(ctx, tick);
        }
    }

    fn owned(&self, owner: ContextId) -> Ownership {
        if self.global_model {
            Ownership::Owned(ContextId::GLOBAL)
        } else {
            Ownership::Owned(owner)
        }
    }
}

impl Host for SimHost {
    fn current_tick(&self, ctx: ContextId) -> u64 {
        self.read().ticks.get(&ctx).copied().unwrap_or(0)
    }

    fn register_tick_hook(&self, hook: TickHook) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    fn resolve_owner(&self, target: &Target) -> Ownership {
        let world = self.read();
        match target {
            Target::Global => Ownership::Owned(ContextId::GLOBAL),
            Target::Entity { id } => match world.entities.get(id) {
                None => Ownership::Invalid,
                Some(None) => Ownership::Unowned,
                Some(Some(ctx)) => self.owned(*ctx),
            },
            Target::Location { world: w, chunk } => {
                if !world.worlds.contains(w) {
                    return Ownership::Invalid;
                }
                match world.chunks.get(&(w.clone(), *chunk)) {
                    None => Ownership::Invalid,
                    Some(None) => Ownership::Unowned,
                    Some(Some(ctx)) => self.owned(*ctx),
                }
            }
            Target::Async => Ownership::Invalid,
        }
    }

    fn is_global_threading_model(&self) -> bool {
        self.global_model
    }
}
