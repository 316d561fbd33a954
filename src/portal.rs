//! Asynchronous consent dialogs with the desktop portal
//!
//! Media operations of sandboxed clients are resolved by asking the user
//! through the portal's `AccessDevice` dialog. The outcome is cached per
//! client and hook kind; while a dialog is open the client record carries
//! the pending request, and a disconnect abandons it without ever invoking
//! the completer.

use crate::client::{ClientMap, PendingPortal, PortalDialog};
use crate::host::{BusValue, MethodCall, PortalBus, SignalMessage};
use crate::types::{AccessHook, AccessRequest, AsyncCompleter, Verdict};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PORTAL_DESTINATION: &str = "org.freedesktop.portal.Desktop";
pub const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
pub const PORTAL_DEVICE_INTERFACE: &str = "org.freedesktop.portal.Device";
pub const PORTAL_ACCESS_DEVICE: &str = "AccessDevice";
pub const PORTAL_REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";
pub const PORTAL_RESPONSE_MEMBER: &str = "Response";
pub const PORTAL_REQUEST_MATCH: &str =
    "type='signal',interface='org.freedesktop.portal.Request'";

/// Device tag the portal prompts for, derived from the hook kind.
pub fn device_for_hook(hook: AccessHook) -> Option<&'static str> {
    match hook {
        AccessHook::ConnectRecord => Some("microphone"),
        AccessHook::ConnectPlayback | AccessHook::PlaySample => Some("speakers"),
        _ => None,
    }
}

/// Builds the `AccessDevice` call:
/// `UINT32 pid, ARRAY<STRING> devices, DICT<STRING,VARIANT> options` (empty).
fn access_device_call(pid: u32, device: &str) -> MethodCall {
    MethodCall {
        destination: PORTAL_DESTINATION.to_string(),
        path: PORTAL_PATH.to_string(),
        interface: PORTAL_DEVICE_INTERFACE.to_string(),
        member: PORTAL_ACCESS_DEVICE.to_string(),
        args: vec![
            BusValue::U32(pid),
            BusValue::StringArray(vec![device.to_string()]),
            BusValue::Dict(HashMap::new()),
        ],
    }
}

/// Outcome of claiming a client's in-flight slot.
enum Gate {
    Cached(bool),
    Busy,
    Misconfigured,
    Issue { pid: i32, device: &'static str },
}

/// Drives the `AccessDevice` consent flow.
pub struct PortalCoordinator {
    bus: Arc<dyn PortalBus>,
    clients: Arc<ClientMap>,
    grant_timeout: Option<Duration>,
}

impl PortalCoordinator {
    /// Create a coordinator over the host's bus connection.
    pub fn new(
        bus: Arc<dyn PortalBus>,
        clients: Arc<ClientMap>,
        grant_timeout: Option<Duration>,
    ) -> Self {
        Self {
            bus,
            clients,
            grant_timeout,
        }
    }

    /// `check_portal` rule: cached decisions resolve immediately; otherwise
    /// open a dialog and return [`Verdict::Pending`].
    ///
    /// Transport failures deny the current request without touching the
    /// cache, so a later attempt asks again.
    pub async fn check(
        &self,
        request: &AccessRequest,
        completer: &mut Option<AsyncCompleter>,
    ) -> Verdict {
        // claim the in-flight slot in the same step as the cache check;
        // the bus call below yields, and more hooks may fire before the
        // dialog resolves
        let gate = self.clients.with_mut(request.client_index, |cd| {
            if let Some(granted) = cd.cached(request.hook) {
                return Gate::Cached(granted);
            }
            if cd.pending.is_some() {
                return Gate::Busy;
            }
            let Some(device) = device_for_hook(request.hook) else {
                return Gate::Misconfigured;
            };
            cd.pending = Some(PortalDialog::Issuing);
            Gate::Issue {
                pid: cd.pid,
                device,
            }
        });

        let (pid, device) = match gate {
            None => return Verdict::Deny,
            Some(Gate::Cached(granted)) => {
                debug!(
                    granted,
                    client = request.client_index,
                    "returned cached answer for portal check"
                );
                return if granted { Verdict::Grant } else { Verdict::Deny };
            }
            Some(Gate::Busy) => {
                // single in-flight slot per client
                info!(
                    client = request.client_index,
                    "portal dialog already pending, denying"
                );
                return Verdict::Deny;
            }
            Some(Gate::Misconfigured) => {
                info!(hook = %request.hook, "no portal device mapping for operation");
                return Verdict::Deny;
            }
            Some(Gate::Issue { pid, device }) => (pid, device),
        };

        info!(
            hook = %request.hook,
            object = request.object_index,
            client = request.client_index,
            "ask portal for operation"
        );

        let reply = match self.bus.call(access_device_call(pid as u32, device)).await {
            Ok(reply) => reply,
            Err(err) => {
                info!(%err, "failed to call portal");
                self.release_slot(request.client_index);
                return Verdict::Deny;
            }
        };

        let Some(handle) = reply.object_path().map(str::to_string) else {
            info!("failed to parse AccessDevice reply");
            self.release_slot(request.client_index);
            return Verdict::Deny;
        };

        if let Err(err) = self.bus.add_match(PORTAL_REQUEST_MATCH) {
            info!(%err, "failed to subscribe to Request signal");
            self.release_slot(request.client_index);
            return Verdict::Deny;
        }

        let filter = {
            let clients = self.clients.clone();
            let bus = Arc::downgrade(&self.bus);
            let client_index = request.client_index;
            self.bus.add_filter(Box::new(move |signal| {
                handle_response(&clients, &bus, client_index, signal)
            }))
        };

        let Some(completer) = completer.take() else {
            // re-entered without a completion capability; cannot suspend
            self.bus.remove_filter(filter);
            self.release_slot(request.client_index);
            return Verdict::Deny;
        };

        let pending = PendingPortal {
            request: *request,
            handle,
            filter,
            completer,
        };
        let stored = self.clients.with_mut(request.client_index, |cd| {
            if matches!(cd.pending, Some(PortalDialog::Issuing)) {
                cd.pending = Some(PortalDialog::Awaiting(pending));
                true
            } else {
                false
            }
        });
        if stored != Some(true) {
            // the client went away while the call was in flight
            self.bus.remove_filter(filter);
            return Verdict::Deny;
        }

        if let Some(timeout) = self.grant_timeout {
            let clients = self.clients.clone();
            let bus = Arc::downgrade(&self.bus);
            let client_index = request.client_index;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(
                    client = client_index,
                    "no portal response before timeout, resolving as granted"
                );
                finish_pending(&clients, bus.upgrade().as_ref(), client_index, true);
            });
            self.clients.with_mut(request.client_index, |cd| {
                cd.disarm_timer();
                cd.grant_timer = Some(timer);
            });
        }

        Verdict::Pending
    }

    /// Drop a slot reservation that never became a dialog.
    fn release_slot(&self, client_index: u32) {
        self.clients.with_mut(client_index, |cd| {
            if matches!(cd.pending, Some(PortalDialog::Issuing)) {
                cd.pending = None;
            }
        });
    }
}

/// Signal filter installed per dialog: reacts to the `Response` emitted on
/// the request object this client is waiting for.
fn handle_response(
    clients: &ClientMap,
    bus: &Weak<dyn PortalBus>,
    client_index: u32,
    signal: &SignalMessage,
) -> bool {
    if signal.interface != PORTAL_REQUEST_INTERFACE || signal.member != PORTAL_RESPONSE_MEMBER {
        return false;
    }

    let matches = clients
        .with(client_index, |cd| {
            matches!(
                &cd.pending,
                Some(PortalDialog::Awaiting(pending)) if pending.handle == signal.path
            )
        })
        .unwrap_or(false);
    if !matches {
        return false;
    }

    let response = match signal.u32_arg(0) {
        Some(code) => code,
        None => {
            info!("failed to parse Response signal, treating as denied");
            2
        }
    };

    let granted = response == 0;
    info!(granted, client = client_index, "portal check result");
    finish_pending(clients, bus.upgrade().as_ref(), client_index, granted);
    true
}

/// Resolve the client's pending dialog: cache the decision, tear down the
/// filter and timer, and deliver the late verdict.
pub(crate) fn finish_pending(
    clients: &ClientMap,
    bus: Option<&Arc<dyn PortalBus>>,
    client_index: u32,
    granted: bool,
) {
    let finished = clients
        .with_mut(client_index, |cd| match cd.pending.take() {
            Some(PortalDialog::Awaiting(pending)) => {
                cd.cache_decision(pending.request.hook, granted);
                cd.disarm_timer();
                Some(pending)
            }
            other => {
                // an Issuing reservation has nothing to resolve yet
                cd.pending = other;
                None
            }
        })
        .flatten();

    let Some(pending) = finished else { return };

    if let Some(bus) = bus {
        bus.remove_filter(pending.filter);
    }

    // deliver outside the map guard; the host may re-enter
    pending.completer.finish(&pending.request, granted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{BusError, FilterHandle, MethodReply, SignalFilter};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    type SharedFilter = Arc<dyn Fn(&SignalMessage) -> bool + Send + Sync>;

    struct ScriptedBus {
        calls: Mutex<Vec<MethodCall>>,
        replies: Mutex<VecDeque<Result<MethodReply, BusError>>>,
        matches: Mutex<Vec<String>>,
        filters: Mutex<Vec<(u64, SharedFilter)>>,
        next_filter: AtomicU64,
        /// When set, `call` parks on this notify before replying.
        hold: Mutex<Option<Arc<tokio::sync::Notify>>>,
    }

    impl ScriptedBus {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                replies: Mutex::new(VecDeque::new()),
                matches: Mutex::new(Vec::new()),
                filters: Mutex::new(Vec::new()),
                next_filter: AtomicU64::new(1),
                hold: Mutex::new(None),
            }
        }

        fn push_reply(&self, reply: Result<MethodReply, BusError>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn push_request_path(&self, path: &str) {
            self.push_reply(Ok(MethodReply {
                args: vec![BusValue::ObjectPath(path.to_string())],
            }));
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn filter_count(&self) -> usize {
            self.filters.lock().unwrap().len()
        }

        fn emit(&self, signal: &SignalMessage) -> bool {
            let filters: Vec<SharedFilter> = self
                .filters
                .lock()
                .unwrap()
                .iter()
                .map(|(_, filter)| filter.clone())
                .collect();
            filters.iter().any(|filter| filter(signal))
        }
    }

    #[async_trait]
    impl PortalBus for ScriptedBus {
        async fn call(&self, msg: MethodCall) -> Result<MethodReply, BusError> {
            self.calls.lock().unwrap().push(msg);
            let hold = self.hold.lock().unwrap().clone();
            if let Some(hold) = hold {
                hold.notified().await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(BusError::Disconnected))
        }

        fn add_match(&self, expression: &str) -> Result<(), BusError> {
            self.matches.lock().unwrap().push(expression.to_string());
            Ok(())
        }

        fn add_filter(&self, filter: SignalFilter) -> FilterHandle {
            let id = self.next_filter.fetch_add(1, Ordering::SeqCst);
            self.filters.lock().unwrap().push((id, Arc::from(filter)));
            FilterHandle(id)
        }

        fn remove_filter(&self, handle: FilterHandle) {
            self.filters.lock().unwrap().retain(|(id, _)| *id != handle.0);
        }
    }

    fn response_signal(path: &str, code: u32) -> SignalMessage {
        SignalMessage {
            interface: PORTAL_REQUEST_INTERFACE.to_string(),
            member: PORTAL_RESPONSE_MEMBER.to_string(),
            path: path.to_string(),
            args: vec![BusValue::U32(code)],
        }
    }

    struct Fixture {
        bus: Arc<ScriptedBus>,
        clients: Arc<ClientMap>,
        coordinator: PortalCoordinator,
        verdicts: Arc<Mutex<Vec<bool>>>,
    }

    impl Fixture {
        fn new(grant_timeout: Option<Duration>) -> Self {
            let bus = Arc::new(ScriptedBus::new());
            let clients = Arc::new(ClientMap::new());
            let coordinator = PortalCoordinator::new(
                bus.clone() as Arc<dyn PortalBus>,
                clients.clone(),
                grant_timeout,
            );
            Self {
                bus,
                clients,
                coordinator,
                verdicts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn completer(&self) -> Option<AsyncCompleter> {
            let verdicts = self.verdicts.clone();
            Some(AsyncCompleter::new(move |_request, granted| {
                verdicts.lock().unwrap().push(granted);
            }))
        }

        fn push_garbage_reply(&self) {
            self.bus.push_reply(Ok(MethodReply {
                args: vec![BusValue::U32(0)],
            }));
        }
    }

    #[tokio::test]
    async fn test_device_mapping() {
        assert_eq!(device_for_hook(AccessHook::ConnectRecord), Some("microphone"));
        assert_eq!(device_for_hook(AccessHook::ConnectPlayback), Some("speakers"));
        assert_eq!(device_for_hook(AccessHook::PlaySample), Some("speakers"));
        assert_eq!(device_for_hook(AccessHook::GetSinkInfo), None);
    }

    #[tokio::test]
    async fn test_access_device_call_shape() {
        let call = access_device_call(4242, "speakers");

        assert_eq!(call.destination, "org.freedesktop.portal.Desktop");
        assert_eq!(call.path, "/org/freedesktop/portal/desktop");
        assert_eq!(call.interface, "org.freedesktop.portal.Device");
        assert_eq!(call.member, "AccessDevice");
        assert_eq!(
            call.args,
            vec![
                BusValue::U32(4242),
                BusValue::StringArray(vec!["speakers".to_string()]),
                BusValue::Dict(HashMap::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_dialog_granted_and_cached() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);
        fixture.bus.push_request_path("/org/freedesktop/portal/desktop/request/1");

        let request = AccessRequest::new(AccessHook::ConnectPlayback, 11, 0);
        let mut completer = fixture.completer();
        let verdict = fixture.coordinator.check(&request, &mut completer).await;

        assert_eq!(verdict, Verdict::Pending);
        assert!(completer.is_none());
        assert_eq!(fixture.bus.call_count(), 1);
        assert_eq!(fixture.bus.filter_count(), 1);
        assert_eq!(
            fixture.bus.matches.lock().unwrap().as_slice(),
            &[PORTAL_REQUEST_MATCH.to_string()]
        );

        let handled = fixture
            .bus
            .emit(&response_signal("/org/freedesktop/portal/desktop/request/1", 0));
        assert!(handled);

        assert_eq!(*fixture.verdicts.lock().unwrap(), vec![true]);
        assert_eq!(
            fixture
                .clients
                .with(11, |cd| cd.cached(AccessHook::ConnectPlayback)),
            Some(Some(true))
        );
        assert_eq!(fixture.bus.filter_count(), 0);
        assert_eq!(fixture.clients.with(11, |cd| cd.pending.is_some()), Some(false));
    }

    #[tokio::test]
    async fn test_cached_grant_skips_the_bus() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);
        fixture
            .clients
            .with_mut(11, |cd| cd.cache_decision(AccessHook::ConnectPlayback, true));

        let request = AccessRequest::new(AccessHook::ConnectPlayback, 11, 0);
        let mut completer = fixture.completer();
        let verdict = fixture.coordinator.check(&request, &mut completer).await;

        assert_eq!(verdict, Verdict::Grant);
        assert!(completer.is_some());
        assert_eq!(fixture.bus.call_count(), 0);
    }

    #[tokio::test]
    async fn test_denial_is_cached() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);
        fixture.bus.push_request_path("/request/9");

        let request = AccessRequest::new(AccessHook::ConnectPlayback, 11, 0);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Pending
        );

        fixture.bus.emit(&response_signal("/request/9", 2));
        assert_eq!(*fixture.verdicts.lock().unwrap(), vec![false]);

        // next attempt resolves from the cache, no new dialog
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Deny
        );
        assert_eq!(fixture.bus.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_response_path_is_ignored() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);
        fixture.bus.push_request_path("/request/9");

        let request = AccessRequest::new(AccessHook::ConnectRecord, 11, 0);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Pending
        );

        let handled = fixture.bus.emit(&response_signal("/request/other", 0));
        assert!(!handled);
        assert!(fixture.verdicts.lock().unwrap().is_empty());
        assert_eq!(fixture.clients.with(11, |cd| cd.pending.is_some()), Some(true));
    }

    #[tokio::test]
    async fn test_call_failure_denies_without_poisoning_cache() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);
        fixture
            .bus
            .push_reply(Err(BusError::SendFailed("no portal".to_string())));

        let request = AccessRequest::new(AccessHook::ConnectPlayback, 11, 0);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Deny
        );

        assert_eq!(
            fixture
                .clients
                .with(11, |cd| cd.cached(AccessHook::ConnectPlayback)),
            Some(None)
        );

        // a later attempt issues a fresh dialog
        fixture.bus.push_request_path("/request/2");
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Pending
        );
        assert_eq!(fixture.bus.call_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_reply_denies() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);
        fixture.push_garbage_reply();

        let request = AccessRequest::new(AccessHook::PlaySample, 11, 3);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Deny
        );
    }

    #[tokio::test]
    async fn test_hook_without_device_mapping_denies() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);

        let request = AccessRequest::new(AccessHook::Stat, 11, 0);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Deny
        );
        assert_eq!(fixture.bus.call_count(), 0);
    }

    #[tokio::test]
    async fn test_second_request_while_pending_is_denied() {
        let fixture = Fixture::new(None);
        fixture.clients.put(11, 1, 4242, true);
        fixture.bus.push_request_path("/request/1");

        let request = AccessRequest::new(AccessHook::ConnectPlayback, 11, 0);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Pending
        );

        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Deny
        );
        assert_eq!(fixture.bus.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_client_denies() {
        let fixture = Fixture::new(None);

        let request = AccessRequest::new(AccessHook::ConnectPlayback, 99, 0);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Deny
        );
    }

    #[tokio::test]
    async fn test_second_request_during_call_window_is_denied() {
        let bus = Arc::new(ScriptedBus::new());
        let clients = Arc::new(ClientMap::new());
        let coordinator = Arc::new(PortalCoordinator::new(
            bus.clone() as Arc<dyn PortalBus>,
            clients.clone(),
            None,
        ));
        clients.put(11, 1, 4242, true);

        let hold = Arc::new(tokio::sync::Notify::new());
        *bus.hold.lock().unwrap() = Some(hold.clone());
        bus.push_request_path("/request/1");

        let verdicts = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let coordinator = coordinator.clone();
            let verdicts = verdicts.clone();
            tokio::spawn(async move {
                let request = AccessRequest::new(AccessHook::ConnectPlayback, 11, 0);
                let mut completer = Some(AsyncCompleter::new(move |_request, granted| {
                    verdicts.lock().unwrap().push(granted);
                }));
                coordinator.check(&request, &mut completer).await
            })
        };

        // let the first request park inside the portal call
        for _ in 0..10 {
            if bus.call_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.call_count(), 1);
        assert_eq!(clients.with(11, |cd| cd.pending.is_some()), Some(true));

        // a second request for the same client hits the claimed slot
        let request = AccessRequest::new(AccessHook::ConnectPlayback, 11, 0);
        let mut completer = None;
        assert_eq!(
            coordinator.check(&request, &mut completer).await,
            Verdict::Deny
        );
        assert_eq!(bus.call_count(), 1);

        // the first dialog is unharmed and completes normally
        hold.notify_one();
        assert_eq!(first.await.unwrap(), Verdict::Pending);
        assert_eq!(bus.filter_count(), 1);

        bus.emit(&response_signal("/request/1", 0));
        assert_eq!(*verdicts.lock().unwrap(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_as_granted() {
        let fixture = Fixture::new(Some(Duration::from_secs(30)));
        fixture.clients.put(11, 1, 4242, true);
        fixture.bus.push_request_path("/request/1");

        let request = AccessRequest::new(AccessHook::ConnectRecord, 11, 0);
        let mut completer = fixture.completer();
        assert_eq!(
            fixture.coordinator.check(&request, &mut completer).await,
            Verdict::Pending
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        // let the timer task run to completion
        tokio::task::yield_now().await;

        assert_eq!(*fixture.verdicts.lock().unwrap(), vec![true]);
        assert_eq!(
            fixture
                .clients
                .with(11, |cd| cd.cached(AccessHook::ConnectRecord)),
            Some(Some(true))
        );
        assert_eq!(fixture.bus.filter_count(), 0);
    }
}
