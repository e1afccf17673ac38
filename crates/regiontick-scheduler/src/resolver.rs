use std::sync::Arc;

use regiontick_core::{ContextId, Ownership, Target};
use tracing::{trace, warn};

use crate::host::Host;

/// Answers "which context must run this target right now".
///
/// Stateless and read-only: any number of region threads and the retry
/// poller call it concurrently.
#[derive(Clone)]
pub struct ContextResolver {
    host: Arc<dyn Host>,
}

impl ContextResolver {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }

    pub fn resolve(&self, target: &Target) -> Ownership {
        let ownership = match target {
            // The global context always exists; no need to ask the host.
            Target::Global => Ownership::Owned(ContextId::GLOBAL),
            Target::Entity { .. } | Target::Location { .. } => self.host.resolve_owner(target),
            Target::Async => {
                warn!("async target reached the context resolver; treating as invalid");
                Ownership::Invalid
            }
        };
        trace!(%target, ?ownership, "target resolved");
        ownership
    }

    /// Tick the context is on, per the host.
    pub fn current_tick(&self, ctx: ContextId) -> u64 {
        self.host.current_tick(ctx)
    }
}
