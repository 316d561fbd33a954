//! Built-in rule implementations
//!
//! The synchronous rules live here: `allow`, `block` and the owner check.
//! The portal rule is asynchronous and handled by the
//! [`PortalCoordinator`](crate::portal::PortalCoordinator).

use crate::host::ObjectRegistry;
use crate::types::{AccessHook, AccessRequest, Verdict};
use std::sync::Arc;
use tracing::{debug, info};

/// Evaluates the synchronous built-in rules.
pub struct RuleEngine {
    objects: Arc<dyn ObjectRegistry>,
}

impl RuleEngine {
    /// Create a rule engine over the host's object registries.
    pub fn new(objects: Arc<dyn ObjectRegistry>) -> Self {
        Self { objects }
    }

    /// `allow`: log and grant.
    pub fn allow(&self, request: &AccessRequest) -> Verdict {
        debug!(
            hook = %request.hook,
            object = request.object_index,
            client = request.client_index,
            "allow operation"
        );
        Verdict::Grant
    }

    /// `block`: log and deny.
    pub fn block(&self, request: &AccessRequest) -> Verdict {
        info!(
            hook = %request.hook,
            object = request.object_index,
            client = request.client_index,
            "blocked operation"
        );
        Verdict::Deny
    }

    /// `check_owner`: grant only when the requesting client owns the target.
    ///
    /// Client hooks target the client object itself; stream hooks resolve
    /// the owning client through the host registry. Hooks with no ownership
    /// notion deny.
    pub fn check_owner(&self, request: &AccessRequest) -> Verdict {
        let owner = match request.hook {
            AccessHook::GetClientInfo | AccessHook::KillClient => Some(request.object_index),

            AccessHook::GetSinkInputInfo
            | AccessHook::MoveSinkInput
            | AccessHook::SetSinkInputVolume
            | AccessHook::SetSinkInputMute
            | AccessHook::KillSinkInput => self.objects.sink_input_owner(request.object_index),

            AccessHook::GetSourceOutputInfo
            | AccessHook::MoveSourceOutput
            | AccessHook::SetSourceOutputVolume
            | AccessHook::SetSourceOutputMute
            | AccessHook::KillSourceOutput => {
                self.objects.source_output_owner(request.object_index)
            }

            _ => None,
        };

        if owner == Some(request.client_index) {
            Verdict::Grant
        } else {
            info!(
                hook = %request.hook,
                object = request.object_index,
                owner = ?owner,
                client = request.client_index,
                "blocked operation, owner mismatch"
            );
            Verdict::Deny
        }
    }
}
