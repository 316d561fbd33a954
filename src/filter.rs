//! Subscription event visibility filtering
//!
//! Subscription events would otherwise leak the existence of objects a
//! client may not inspect. The filter admits an event only when the client
//! is entitled to learn about the object, and keeps the per-client seen set
//! consistent so change and removal notifications never contradict what the
//! client already knows.

use crate::client::ClientMap;
use crate::hooks::HookBus;
use crate::types::{AccessRequest, EventType, Facility, Verdict};
use std::sync::Arc;
use tracing::debug;

/// Filters subscription events for their destination client.
pub struct EventFilter {
    clients: Arc<ClientMap>,
    hooks: Arc<HookBus>,
}

impl EventFilter {
    /// Create a filter over the client map and the hook bus used for
    /// re-entrant info checks.
    pub fn new(clients: Arc<ClientMap>, hooks: Arc<HookBus>) -> Self {
        Self { clients, hooks }
    }

    /// Decide whether the event may be delivered to its destination client.
    pub async fn filter(&self, request: &AccessRequest) -> Verdict {
        let facility = match Facility::from_event(request.event) {
            Some(facility) => facility,
            None => return self.block(request),
        };

        // unknown client destination, block event
        if !self.clients.contains(request.client_index) {
            return self.block(request);
        }

        match EventType::from_event(request.event) {
            Some(EventType::Remove) => {
                // if the client saw this object before, let the event through
                let seen = self
                    .clients
                    .with_mut(request.client_index, |cd| {
                        cd.forget_seen(facility, request.object_index)
                    })
                    .unwrap_or(false);
                if seen {
                    self.pass(request)
                } else {
                    self.block(request)
                }
            }
            Some(EventType::Change) => {
                let seen = self
                    .clients
                    .with(request.client_index, |cd| {
                        cd.has_seen(facility, request.object_index)
                    })
                    .unwrap_or(false);
                if seen {
                    self.pass(request)
                } else {
                    self.admit_new(request, facility).await
                }
            }
            Some(EventType::New) => self.admit_new(request, facility).await,
            None => self.block(request),
        }
    }

    /// New object: check whether the client is allowed to inspect it, and
    /// remember it on success.
    async fn admit_new(&self, request: &AccessRequest, facility: Facility) -> Verdict {
        let probe = AccessRequest::new(
            facility.info_hook(),
            request.client_index,
            request.object_index,
        );

        let mut completer = None;
        if self.hooks.fire(&probe, &mut completer).await == Verdict::Grant {
            self.clients.with_mut(request.client_index, |cd| {
                cd.record_seen(facility, request.object_index);
            });
            self.pass(request)
        } else {
            self.block(request)
        }
    }

    fn pass(&self, request: &AccessRequest) -> Verdict {
        debug!(
            event = %format_args!("{:02x}", request.event),
            object = request.object_index,
            client = request.client_index,
            "pass event"
        );
        Verdict::Grant
    }

    fn block(&self, request: &AccessRequest) -> Verdict {
        debug!(
            event = %format_args!("{:02x}", request.event),
            object = request.object_index,
            client = request.client_index,
            "blocked event"
        );
        Verdict::Deny
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{AccessHandler, HookPriority};
    use crate::types::{AccessHook, AsyncCompleter};
    use async_trait::async_trait;

    /// Grants info queries only for the configured client.
    struct OwnerOnly {
        client_index: u32,
    }

    #[async_trait]
    impl AccessHandler for OwnerOnly {
        async fn handle(
            &self,
            request: &AccessRequest,
            _completer: &mut Option<AsyncCompleter>,
        ) -> Verdict {
            if request.client_index == self.client_index {
                Verdict::Grant
            } else {
                Verdict::Deny
            }
        }

        fn name(&self) -> &str {
            "owner-only"
        }
    }

    fn fixture(owner: u32) -> (Arc<ClientMap>, EventFilter) {
        let clients = Arc::new(ClientMap::new());
        let hooks = Arc::new(HookBus::new());
        hooks.register(
            AccessHook::GetSinkInputInfo,
            HookPriority::EARLY,
            Arc::new(OwnerOnly {
                client_index: owner,
            }),
        );
        let filter = EventFilter::new(clients.clone(), hooks);
        (clients, filter)
    }

    fn event(event_type: EventType, facility: Facility) -> u32 {
        event_type.with_facility(facility)
    }

    #[tokio::test]
    async fn test_new_event_admitted_for_owner() {
        let (clients, filter) = fixture(4);
        clients.put(4, 0, 100, true);

        let request = AccessRequest::subscribe_event(
            4,
            event(EventType::New, Facility::SinkInput),
            77,
        );
        assert_eq!(filter.filter(&request).await, Verdict::Grant);
        assert_eq!(
            clients.with(4, |cd| cd.has_seen(Facility::SinkInput, 77)),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_new_event_blocked_for_stranger() {
        let (clients, filter) = fixture(9);
        clients.put(4, 0, 100, true);

        let request = AccessRequest::subscribe_event(
            4,
            event(EventType::New, Facility::SinkInput),
            77,
        );
        assert_eq!(filter.filter(&request).await, Verdict::Deny);
        assert_eq!(
            clients.with(4, |cd| cd.has_seen(Facility::SinkInput, 77)),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_change_passes_only_when_seen() {
        let (clients, filter) = fixture(4);
        clients.put(4, 0, 100, true);

        let change = AccessRequest::subscribe_event(
            4,
            event(EventType::Change, Facility::SinkInput),
            77,
        );
        // unseen change runs the info check and admits
        assert_eq!(filter.filter(&change).await, Verdict::Grant);
        // now seen, passes without another check
        assert_eq!(filter.filter(&change).await, Verdict::Grant);
    }

    #[tokio::test]
    async fn test_remove_purges_and_requires_prior_knowledge() {
        let (clients, filter) = fixture(4);
        clients.put(4, 0, 100, true);

        let remove = AccessRequest::subscribe_event(
            4,
            event(EventType::Remove, Facility::SinkInput),
            77,
        );
        // never seen: removal is not delivered
        assert_eq!(filter.filter(&remove).await, Verdict::Deny);

        let new = AccessRequest::subscribe_event(
            4,
            event(EventType::New, Facility::SinkInput),
            77,
        );
        assert_eq!(filter.filter(&new).await, Verdict::Grant);
        assert_eq!(filter.filter(&remove).await, Verdict::Grant);
        assert_eq!(
            clients.with(4, |cd| cd.has_seen(Facility::SinkInput, 77)),
            Some(false)
        );
        // second removal for the same object is not delivered again
        assert_eq!(filter.filter(&remove).await, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_new_remove_new_leaves_single_entry() {
        let (clients, filter) = fixture(4);
        clients.put(4, 0, 100, true);

        let new = AccessRequest::subscribe_event(
            4,
            event(EventType::New, Facility::SinkInput),
            77,
        );
        let remove = AccessRequest::subscribe_event(
            4,
            event(EventType::Remove, Facility::SinkInput),
            77,
        );

        assert_eq!(filter.filter(&new).await, Verdict::Grant);
        assert_eq!(filter.filter(&remove).await, Verdict::Grant);
        assert_eq!(filter.filter(&new).await, Verdict::Grant);
        assert_eq!(clients.with(4, |cd| cd.seen_len()), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_client_blocks() {
        let (_clients, filter) = fixture(4);

        let request = AccessRequest::subscribe_event(
            4,
            event(EventType::New, Facility::SinkInput),
            77,
        );
        assert_eq!(filter.filter(&request).await, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_unknown_facility_blocks() {
        let (clients, filter) = fixture(4);
        clients.put(4, 0, 100, true);

        // 0x0008 is not a valid facility
        let request = AccessRequest::subscribe_event(4, 0x0008, 77);
        assert_eq!(filter.filter(&request).await, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_unknown_event_type_blocks() {
        let (clients, filter) = fixture(4);
        clients.put(4, 0, 100, true);

        // type bits 0x30 name no event type
        let request = AccessRequest::subscribe_event(4, 0x0030 | 0x0002, 77);
        assert_eq!(filter.filter(&request).await, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_facility_without_registered_handler_admits() {
        // an empty hook chain grants, so the event is admitted
        let (clients, filter) = fixture(4);
        clients.put(4, 0, 100, true);

        let request =
            AccessRequest::subscribe_event(4, event(EventType::New, Facility::Sink), 3);
        assert_eq!(filter.filter(&request).await, Verdict::Grant);
        assert_eq!(clients.with(4, |cd| cd.has_seen(Facility::Sink, 3)), Some(true));
    }
}
