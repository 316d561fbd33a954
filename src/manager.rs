//! Access manager: hook orchestration and client lifecycle
//!
//! The manager is the single root of the subsystem. It owns the policy
//! table, the client map, the rule engine, the event filter and the portal
//! coordinator, registers one handler per hook kind on the bus at early
//! priority, and follows client lifecycle notifications from the host.

use crate::client::{ClientInfo, ClientMap, PortalDialog};
use crate::config::AccessConfig;
use crate::errors::{AccessError, AccessResult};
use crate::filter::EventFilter;
use crate::hooks::{AccessHandler, HookBus, HookPriority, SlotId};
use crate::host::{ObjectRegistry, PortalBus};
use crate::observe::{DecisionLog, DecisionObserver, LoggingObserver};
use crate::policy::{install_well_known, PolicyTable, Rule, WellKnownPolicies};
use crate::portal::PortalCoordinator;
use crate::rules::RuleEngine;
use crate::sandbox::SandboxClassifier;
use crate::types::{AccessHook, AccessRequest, AsyncCompleter, Facility, Verdict};
use async_trait::async_trait;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Root of the access-control core.
pub struct AccessManager {
    policies: PolicyTable,
    well_known: WellKnownPolicies,
    clients: Arc<ClientMap>,
    classifier: SandboxClassifier,
    rules: RuleEngine,
    portal: PortalCoordinator,
    filter: EventFilter,
    hooks: Arc<HookBus>,
    bus: Arc<dyn PortalBus>,
    decisions: DecisionLog,
    slots: RwLock<Vec<SlotId>>,
}

impl AccessManager {
    /// Module init: build the well-known policies, wire the collaborators
    /// and register one handler per hook kind at early priority.
    pub fn load(
        hooks: Arc<HookBus>,
        objects: Arc<dyn ObjectRegistry>,
        bus: Arc<dyn PortalBus>,
        config: AccessConfig,
    ) -> AccessResult<Arc<Self>> {
        config.validate().map_err(AccessError::invalid_config)?;

        let mut policies = PolicyTable::new();
        let well_known = install_well_known(&mut policies)?;

        let clients = Arc::new(ClientMap::new());
        let grant_timeout = config.pending_grant_timeout_ms.map(Duration::from_millis);

        let decisions = DecisionLog::new();
        if config.log_decisions {
            decisions.register(Arc::new(LoggingObserver));
        }

        let manager = Arc::new(Self {
            policies,
            well_known,
            clients: clients.clone(),
            classifier: SandboxClassifier::new(&config.proc_root),
            rules: RuleEngine::new(objects),
            portal: PortalCoordinator::new(bus.clone(), clients.clone(), grant_timeout),
            filter: EventFilter::new(clients, hooks.clone()),
            hooks,
            bus,
            decisions,
            slots: RwLock::new(Vec::new()),
        });

        Self::register_hooks(&manager);

        Ok(manager)
    }

    fn register_hooks(manager: &Arc<Self>) {
        let mut slots = Vec::with_capacity(AccessHook::COUNT);

        for hook in AccessHook::ALL {
            let handler: Arc<dyn AccessHandler> = if hook == AccessHook::FilterSubscribeEvent {
                Arc::new(FilterEventHandler {
                    manager: Arc::downgrade(manager),
                })
            } else {
                Arc::new(CheckAccessHandler {
                    manager: Arc::downgrade(manager),
                })
            };
            slots.push(manager.hooks.register(hook, HookPriority::EARLY, handler));
        }

        if let Ok(mut registered) = manager.slots.write() {
            *registered = slots;
        }
    }

    /// Module teardown: unregister hook slots in reverse order and drop all
    /// client records, abandoning any pending dialogs.
    pub fn unload(&self) {
        if let Ok(mut slots) = self.slots.write() {
            while let Some(slot) = slots.pop() {
                self.hooks.unregister(slot);
            }
        }

        for index in self.clients.indices() {
            self.client_unlink(index);
        }
    }

    /// Evaluate an access request against the requesting client's policy.
    pub async fn check_access(
        &self,
        request: &AccessRequest,
        completer: &mut Option<AsyncCompleter>,
    ) -> Verdict {
        // unknown client: conservative deny
        let Some(policy) = self.clients.with(request.client_index, |cd| cd.policy) else {
            return self.decided(request, Verdict::Deny);
        };

        let Some(rule) = self.policies.get_rule(policy, request.hook) else {
            return self.decided(request, Verdict::Deny);
        };

        let verdict = match rule {
            Rule::Allow => self.rules.allow(request),
            Rule::Block => self.rules.block(request),
            Rule::CheckOwner => self.rules.check_owner(request),
            Rule::CheckPortal => self.portal.check(request, completer).await,
        };

        self.decided(request, verdict)
    }

    /// Filter a subscription event for its destination client.
    pub async fn filter_event(&self, request: &AccessRequest) -> Verdict {
        let verdict = self.filter.filter(request).await;
        self.decided(request, verdict)
    }

    fn decided(&self, request: &AccessRequest, verdict: Verdict) -> Verdict {
        self.decisions.record(request, verdict);
        verdict
    }

    /// A client connected: pick a policy and create its record.
    pub fn client_put(&self, client: &ClientInfo) {
        let policy = self.policy_for_client(client);
        self.clients
            .put(client.index, policy, client.pid, client.credentials_valid);
        info!(
            client = client.index,
            pid = client.pid,
            policy,
            "new client"
        );
    }

    /// The client finished authenticating; its credentials are now
    /// trustworthy, so re-classify.
    pub fn client_auth(&self, client: &ClientInfo) {
        self.reclassify(client);
    }

    /// The client's properties changed; re-classify.
    pub fn client_proplist_changed(&self, client: &ClientInfo) {
        self.reclassify(client);
    }

    fn reclassify(&self, client: &ClientInfo) {
        if !self.clients.contains(client.index) {
            return;
        }

        let policy = self.policy_for_client(client);
        self.clients.with_mut(client.index, |cd| {
            cd.policy = policy;
            cd.pid = client.pid;
            cd.credentials_valid = client.credentials_valid;
        });
        debug!(client = client.index, pid = client.pid, policy, "client re-classified");
    }

    /// A client disconnected: tear down its record and any pending dialog.
    /// The pending completer is abandoned, never invoked.
    pub fn client_unlink(&self, client_index: u32) {
        let Some(mut record) = self.clients.remove(client_index) else {
            return;
        };

        if let Some(PortalDialog::Awaiting(pending)) = record.pending.take() {
            self.bus.remove_filter(pending.filter);
        }

        info!(client = client_index, "removed client");
        // dropping the record disarms the grant timer
    }

    fn policy_for_client(&self, client: &ClientInfo) -> u32 {
        debug!(client = client.index, proplist = ?client.proplist, "classifying client");

        if self.classifier.is_sandboxed(client) {
            debug!(client = client.index, "client is sandboxed, choosing portal policy");
            self.well_known.portal_policy
        } else {
            debug!(client = client.index, "client not sandboxed, choosing default policy");
            self.well_known.default_policy
        }
    }

    /// Register an additional decision observer.
    pub fn register_observer(&self, observer: Arc<dyn DecisionObserver>) {
        self.decisions.register(observer);
    }

    /// Index of the policy for trusted local clients.
    pub fn default_policy(&self) -> u32 {
        self.well_known.default_policy
    }

    /// Index of the policy for sandboxed clients.
    pub fn portal_policy(&self) -> u32 {
        self.well_known.portal_policy
    }

    /// Policy currently assigned to a client.
    pub fn client_policy(&self, client_index: u32) -> Option<u32> {
        self.clients.with(client_index, |cd| cd.policy)
    }

    /// Whether the client has been told the object exists.
    pub fn has_seen(&self, client_index: u32, facility: Facility, object_index: u32) -> bool {
        self.clients
            .with(client_index, |cd| cd.has_seen(facility, object_index))
            .unwrap_or(false)
    }

    /// Cached portal decision for a client and hook, if any.
    pub fn cached_decision(&self, client_index: u32, hook: AccessHook) -> Option<bool> {
        self.clients
            .with(client_index, |cd| cd.cached(hook))
            .flatten()
    }

    /// Whether the client has a portal dialog in flight.
    pub fn has_pending(&self, client_index: u32) -> bool {
        self.clients
            .with(client_index, |cd| cd.pending.is_some())
            .unwrap_or(false)
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Handler for every hook kind except event filtering.
struct CheckAccessHandler {
    manager: Weak<AccessManager>,
}

#[async_trait]
impl AccessHandler for CheckAccessHandler {
    async fn handle(
        &self,
        request: &AccessRequest,
        completer: &mut Option<AsyncCompleter>,
    ) -> Verdict {
        match self.manager.upgrade() {
            Some(manager) => manager.check_access(request, completer).await,
            None => Verdict::Deny,
        }
    }

    fn name(&self) -> &str {
        "check-access"
    }
}

/// Handler for `FilterSubscribeEvent`.
struct FilterEventHandler {
    manager: Weak<AccessManager>,
}

#[async_trait]
impl AccessHandler for FilterEventHandler {
    async fn handle(
        &self,
        request: &AccessRequest,
        _completer: &mut Option<AsyncCompleter>,
    ) -> Verdict {
        match self.manager.upgrade() {
            Some(manager) => manager.filter_event(request).await,
            None => Verdict::Deny,
        }
    }

    fn name(&self) -> &str {
        "filter-event"
    }
}
