use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one execution context: the global tick thread or one region.
///
/// `ContextId::GLOBAL` is the context that owns `Target::Global` under both
/// threading models. Region contexts are assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u32);

impl ContextId {
    pub const GLOBAL: ContextId = ContextId(0);

    pub fn is_global(&self) -> bool {
        *self == Self::GLOBAL
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            write!(f, "global")
        } else {
            write!(f, "region-{}", self.0)
        }
    }
}

/// Unique identifier for a world entity (UUIDv7, sortable like the host keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a world (dimension) as known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorldId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Chunk coordinate: a 16x16 column of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing the given block coordinate (arithmetic shift, so
    /// negative coordinates land in the right chunk).
    pub fn from_block(x: i32, z: i32) -> Self {
        Self { x: x >> 4, z: z >> 4 }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Where a task must run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// The global tick: the main thread, or the global region when regionized.
    Global,
    /// Whichever context currently owns the entity (follows it across regions).
    Entity { id: EntityId },
    /// Whichever context currently owns the chunk.
    Location { world: WorldId, chunk: ChunkPos },
    /// Off the tick loop entirely, on the unordered worker pool.
    Async,
}

impl Target {
    pub fn entity(id: EntityId) -> Self {
        Target::Entity { id }
    }

    pub fn location(world: impl Into<WorldId>, chunk: ChunkPos) -> Self {
        Target::Location {
            world: world.into(),
            chunk,
        }
    }

    /// Location target for a block coordinate.
    pub fn at_block(world: impl Into<WorldId>, x: i32, z: i32) -> Self {
        Self::location(world, ChunkPos::from_block(x, z))
    }

    /// Async targets never go through ownership resolution.
    pub fn is_async(&self) -> bool {
        matches!(self, Target::Async)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Global => write!(f, "global"),
            Target::Entity { id } => write!(f, "entity:{id}"),
            Target::Location { world, chunk } => write!(f, "location:{world}{chunk}"),
            Target::Async => write!(f, "async"),
        }
    }
}

/// Answer of an ownership lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "context", rename_all = "snake_case")]
pub enum Ownership {
    /// Exactly one context is authoritative for the target right now.
    Owned(ContextId),
    /// The target exists but nobody has claimed it yet (mid-spawn, chunk loading).
    Unowned,
    /// The target no longer exists. Terminal.
    Invalid,
}

/// Which threading model the host runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadingModel {
    /// One global thread ticks everything.
    SingleLoop,
    /// Independent region threads, each owning a slice of the world.
    Regionized,
}

impl fmt::Display for ThreadingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadingModel::SingleLoop => write!(f, "single-loop"),
            ThreadingModel::Regionized => write!(f, "regionized"),
        }
    }
}

impl std::str::FromStr for ThreadingModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single-loop" => Ok(ThreadingModel::SingleLoop),
            "regionized" => Ok(ThreadingModel::Regionized),
            other => Err(format!("unknown threading model: {other}")),
        }
    }
}

/// Configured choice of threading model. `Auto` probes the host once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelSelection {
    #[default]
    Auto,
    SingleLoop,
    Regionized,
}

impl ModelSelection {
    /// Resolve to a concrete model; `probe` is only called for `Auto`.
    pub fn resolve(self, probe: impl FnOnce() -> bool) -> ThreadingModel {
        match self {
            ModelSelection::SingleLoop => ThreadingModel::SingleLoop,
            ModelSelection::Regionized => ThreadingModel::Regionized,
            ModelSelection::Auto => {
                if probe() {
                    ThreadingModel::SingleLoop
                } else {
                    ThreadingModel::Regionized
                }
            }
        }
    }
}

impl From<ThreadingModel> for ModelSelection {
    fn from(model: ThreadingModel) -> Self {
        match model {
            ThreadingModel::SingleLoop => ModelSelection::SingleLoop,
            ThreadingModel::Regionized => ModelSelection::Regionized,
        }
    }
}

impl std::str::FromStr for ModelSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ModelSelection::Auto),
            other => other.parse::<ThreadingModel>().map(Into::into),
        }
    }
}
