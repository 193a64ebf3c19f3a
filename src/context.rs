//! Liveness queries answered by the host application.

use crate::role::{Role, TargetId};

/// What the hidden-session layer needs to know about the application around
/// it. It only ever reads these; it never owns the primary session.
pub trait HostContext: Send + Sync {
    /// Whether the user-visible interactive session to `target` is connected.
    fn is_primary_session_alive(&self, target: &TargetId) -> bool;

    /// Whether anything is still listening for snapshots.
    fn is_receiver_alive(&self) -> bool;

    /// Whether `role` may open hidden connections to `target`.
    fn is_role_enabled(&self, _target: &TargetId, _role: Role) -> bool {
        true
    }
}
