//! Ownership as a value type.
//!
//! Every entity in the control plane (agent, task, resource, message,
//! feedback record) carries an [`Ownership`] tag rather than inheriting
//! access rules from a class hierarchy. Components call [`Ownership::permits`]
//! (or the free function [`access_allowed`]) at the point of use instead of
//! re-deriving the rule locally.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies who an entity belongs to. `System` owns platform-level state
/// (global queues, shared agents); `Tenant` scopes state to one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum OwnerId {
    System,
    Tenant(String),
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerId::System => write!(f, "system"),
            OwnerId::Tenant(id) => write!(f, "{id}"),
        }
    }
}

impl OwnerId {
    /// The queue key a task with this owner is filed under. System-owned
    /// and unowned tasks share the `"global"` queue.
    pub fn queue_key(&self) -> String {
        match self {
            OwnerId::System => "global".to_string(),
            OwnerId::Tenant(id) => id.clone(),
        }
    }
}

/// The three ownership categories from the original system's metadata model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipKind {
    System,
    Client,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ownership {
    pub owner_id: OwnerId,
    pub kind: OwnershipKind,
    /// Whether this entity's data may be exported outside its owning tenant
    /// (e.g. into a cross-owner feedback summary or shared dashboard).
    pub exportable: bool,
}

impl Ownership {
    pub fn system() -> Self {
        Self {
            owner_id: OwnerId::System,
            kind: OwnershipKind::System,
            exportable: true,
        }
    }

    pub fn client(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: OwnerId::Tenant(owner_id.into()),
            kind: OwnershipKind::Client,
            exportable: false,
        }
    }

    pub fn shared(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: OwnerId::Tenant(owner_id.into()),
            kind: OwnershipKind::Shared,
            exportable: true,
        }
    }

    /// True iff `requester` may read or mutate an entity tagged with this
    /// ownership: the entity is system-owned, or the requester matches the
    /// owner.
    pub fn permits(&self, requester: &OwnerId) -> bool {
        matches!(self.owner_id, OwnerId::System) || &self.owner_id == requester
    }

    /// Reassigns ownership to a new tenant, keeping `kind`/`exportable`
    /// unless the caller overrides them. System-owned entities cannot be
    /// transferred to a tenant implicitly through this path.
    pub fn transfer_to(&self, new_owner: OwnerId) -> Result<Self, String> {
        if matches!(self.owner_id, OwnerId::System) {
            return Err("cannot transfer system-owned entity via transfer_to".to_string());
        }
        Ok(Self {
            owner_id: new_owner,
            ..self.clone()
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "owner={} kind={:?} exportable={}",
            self.owner_id, self.kind, self.exportable
        )
    }
}

/// Free-function form of [`Ownership::permits`], used where only the raw
/// owner id (not a full `Ownership` value) is in hand.
pub fn access_allowed(owner_id: &OwnerId, requester: &OwnerId) -> bool {
    matches!(owner_id, OwnerId::System) || owner_id == requester
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_owned_permits_everyone() {
        let o = Ownership::system();
        assert!(o.permits(&OwnerId::System));
        assert!(o.permits(&OwnerId::Tenant("acme".into())));
    }

    #[test]
    fn client_owned_only_permits_matching_tenant() {
        let o = Ownership::client("acme");
        assert!(o.permits(&OwnerId::Tenant("acme".into())));
        assert!(!o.permits(&OwnerId::Tenant("other".into())));
        assert!(!o.permits(&OwnerId::System));
    }

    #[test]
    fn transfer_moves_owner_but_not_kind() {
        let o = Ownership::client("acme");
        let moved = o.transfer_to(OwnerId::Tenant("beta".into())).unwrap();
        assert_eq!(moved.owner_id, OwnerId::Tenant("beta".into()));
        assert_eq!(moved.kind, OwnershipKind::Client);
    }

    #[test]
    fn system_ownership_cannot_be_transferred() {
        let o = Ownership::system();
        assert!(o.transfer_to(OwnerId::Tenant("acme".into())).is_err());
    }
}
