//! Policies map each access hook to a rule
//!
//! Policies are created at initialization, identified by a stable index and
//! never mutated afterwards. Two well-known policies exist: the default
//! policy for trusted local clients, and the portal policy for sandboxed
//! clients, which differ only in how media operations are handled.

use crate::errors::{AccessError, AccessResult};
use crate::types::AccessHook;
use serde::{Deserialize, Serialize};

/// Built-in rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Permit the operation.
    Allow,
    /// Deny the operation.
    Block,
    /// Permit only if the requesting client owns the target object.
    CheckOwner,
    /// Defer to the desktop portal's consent dialog.
    CheckPortal,
}

/// A fixed assignment from each hook kind to a rule.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    index: u32,
    rules: [Rule; AccessHook::COUNT],
}

impl AccessPolicy {
    fn new(index: u32, default_rule: Rule) -> Self {
        Self {
            index,
            rules: [default_rule; AccessHook::COUNT],
        }
    }

    /// Stable index of this policy.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Rule assigned to the given hook.
    pub fn rule(&self, hook: AccessHook) -> Rule {
        self.rules[hook.index()]
    }
}

/// Registry of policies, fixed after initialization.
#[derive(Debug, Default)]
pub struct PolicyTable {
    policies: Vec<AccessPolicy>,
}

impl PolicyTable {
    /// Create an empty policy table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with every hook mapped to `default_rule`.
    pub fn create_policy(&mut self, default_rule: Rule) -> u32 {
        let index = self.policies.len() as u32;
        self.policies.push(AccessPolicy::new(index, default_rule));
        index
    }

    /// Assign a rule to one hook of an existing policy.
    pub fn set_rule(&mut self, policy: u32, hook: AccessHook, rule: Rule) -> AccessResult<()> {
        let entry = self
            .policies
            .get_mut(policy as usize)
            .ok_or(AccessError::UnknownPolicy(policy))?;
        entry.rules[hook.index()] = rule;
        Ok(())
    }

    /// Rule assigned to `hook` by `policy`, if the policy exists.
    pub fn get_rule(&self, policy: u32, hook: AccessHook) -> Option<Rule> {
        self.policies.get(policy as usize).map(|p| p.rule(hook))
    }

    /// Look up a policy by index.
    pub fn get(&self, policy: u32) -> Option<&AccessPolicy> {
        self.policies.get(policy as usize)
    }

    /// Number of installed policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no policy has been created yet.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Indices of the two policies installed at init.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownPolicies {
    /// Policy for trusted local clients.
    pub default_policy: u32,
    /// Policy for sandboxed clients; media operations go through the portal.
    pub portal_policy: u32,
}

/// Info queries that reveal only global state.
const INFO_HOOKS: [AccessHook; 7] = [
    AccessHook::GetSinkInfo,
    AccessHook::GetSourceInfo,
    AccessHook::GetServerInfo,
    AccessHook::GetModuleInfo,
    AccessHook::GetCardInfo,
    AccessHook::Stat,
    AccessHook::GetSampleInfo,
];

/// Operations gated on media device consent for sandboxed clients.
const MEDIA_HOOKS: [AccessHook; 3] = [
    AccessHook::PlaySample,
    AccessHook::ConnectPlayback,
    AccessHook::ConnectRecord,
];

/// Operations on objects that have a well-defined owning client.
const OWNER_HOOKS: [AccessHook; 12] = [
    AccessHook::GetClientInfo,
    AccessHook::KillClient,
    AccessHook::GetSinkInputInfo,
    AccessHook::MoveSinkInput,
    AccessHook::SetSinkInputVolume,
    AccessHook::SetSinkInputMute,
    AccessHook::KillSinkInput,
    AccessHook::GetSourceOutputInfo,
    AccessHook::MoveSourceOutput,
    AccessHook::SetSourceOutputVolume,
    AccessHook::SetSourceOutputMute,
    AccessHook::KillSourceOutput,
];

/// Install the default and portal policies.
///
/// The two tables are identical except that the portal policy routes media
/// operations through the consent dialog instead of allowing them outright.
/// Unlisted hooks keep the block default.
pub fn install_well_known(table: &mut PolicyTable) -> AccessResult<WellKnownPolicies> {
    let default_policy = table.create_policy(Rule::Block);
    for hook in INFO_HOOKS {
        table.set_rule(default_policy, hook, Rule::Allow)?;
    }
    for hook in MEDIA_HOOKS {
        table.set_rule(default_policy, hook, Rule::Allow)?;
    }
    for hook in OWNER_HOOKS {
        table.set_rule(default_policy, hook, Rule::CheckOwner)?;
    }

    let portal_policy = table.create_policy(Rule::Block);
    for hook in INFO_HOOKS {
        table.set_rule(portal_policy, hook, Rule::Allow)?;
    }
    for hook in MEDIA_HOOKS {
        table.set_rule(portal_policy, hook, Rule::CheckPortal)?;
    }
    for hook in OWNER_HOOKS {
        table.set_rule(portal_policy, hook, Rule::CheckOwner)?;
    }

    Ok(WellKnownPolicies {
        default_policy,
        portal_policy,
    })
}
