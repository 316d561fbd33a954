//! Hook bus: registration and dispatch of access handlers
//!
//! The host fires a hook for every sensitive operation; registered handlers
//! run in priority order and the first one that does not grant decides the
//! verdict. An empty chain grants, so an unloaded module never blocks the
//! server.

use crate::types::{AccessHook, AccessRequest, AsyncCompleter, Verdict};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Hook execution priority; lower values run earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HookPriority(pub u16);

impl HookPriority {
    pub const EARLY: Self = Self(100);
    pub const NORMAL: Self = Self(500);
    pub const LATE: Self = Self(900);
}

impl Default for HookPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Identifier of a registered hook slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

/// Handler invoked when an access hook fires.
#[async_trait]
pub trait AccessHandler: Send + Sync {
    /// Evaluate the request. A handler returning [`Verdict::Pending`] must
    /// take the completer out of the slot and resolve it later.
    async fn handle(
        &self,
        request: &AccessRequest,
        completer: &mut Option<AsyncCompleter>,
    ) -> Verdict;

    /// Get the handler name
    fn name(&self) -> &str;
}

struct Slot {
    id: SlotId,
    priority: HookPriority,
    handler: Arc<dyn AccessHandler>,
}

/// Per-kind chains of access handlers.
pub struct HookBus {
    slots: RwLock<HashMap<AccessHook, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl HookBus {
    /// Create an empty hook bus
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for one hook kind.
    pub fn register(
        &self,
        hook: AccessHook,
        priority: HookPriority,
        handler: Arc<dyn AccessHandler>,
    ) -> SlotId {
        let id = SlotId(self.next_id.fetch_add(1, Ordering::SeqCst));

        if let Ok(mut slots) = self.slots.write() {
            let chain = slots.entry(hook).or_default();
            chain.push(Slot {
                id,
                priority,
                handler,
            });
            chain.sort_by_key(|slot| slot.priority);
        }

        id
    }

    /// Unregister a slot. Returns whether it was still registered.
    pub fn unregister(&self, id: SlotId) -> bool {
        let mut removed = false;

        if let Ok(mut slots) = self.slots.write() {
            for chain in slots.values_mut() {
                let before = chain.len();
                chain.retain(|slot| slot.id != id);
                removed |= chain.len() != before;
            }
        }

        removed
    }

    /// Fire a hook: walk the chain in priority order until a handler does
    /// not grant. The losing verdict is returned to the host.
    pub async fn fire(
        &self,
        request: &AccessRequest,
        completer: &mut Option<AsyncCompleter>,
    ) -> Verdict {
        let handlers: Vec<Arc<dyn AccessHandler>> = match self.slots.read() {
            Ok(slots) => slots
                .get(&request.hook)
                .map(|chain| chain.iter().map(|slot| slot.handler.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return Verdict::Deny,
        };

        for handler in handlers {
            match handler.handle(request, completer).await {
                Verdict::Grant => continue,
                other => return other,
            }
        }

        Verdict::Grant
    }

    /// Number of handlers registered for a hook kind.
    pub fn handler_count(&self, hook: AccessHook) -> usize {
        self.slots
            .read()
            .map(|slots| slots.get(&hook).map(|chain| chain.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}
