use std::sync::Arc;

use regiontick_core::{ContextId, Ownership, Target};

/// Called by the host once per tick of each context, on that context's thread.
pub type TickHook = Arc<dyn Fn(ContextId, u64) + Send + Sync>;

/// The simulation engine the scheduler runs inside.
///
/// The host owns the tick loops and the world registry; the scheduler only
/// asks questions and registers one tick hook. Every method may be called
/// from any context thread concurrently.
pub trait Host: Send + Sync {
    /// Tick number the context is on (or last finished). Monotonic per context.
    fn current_tick(&self, ctx: ContextId) -> u64;

    /// Register a hook the host must call once per tick for every context it
    /// runs, passing the context and the tick number being run.
    fn register_tick_hook(&self, hook: TickHook);

    /// Which context owns `target` right now. Never called for `Target::Async`.
    fn resolve_owner(&self, target: &Target) -> Ownership;

    /// One-time probe: `true` if a single global thread runs everything.
    fn is_global_threading_model(&self) -> bool;
}
