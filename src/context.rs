//! The `ClientContext` abstraction (§1, §4.2): the only thing the core
//! consumes from the authentication subsystem. Constructed at the HTTP
//! edge (see [`crate::auth`]) and threaded through every directory/ACL
//! operation.

use std::collections::HashSet;

/// An authenticated (or anonymous) caller, as seen by the ACL engine.
///
/// `client_id` is `None` for anonymous requests. `attributes` are
/// additional group/role identifiers the caller carries (e.g. group
/// membership), checked the same way as the client id itself.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub client_id: Option<String>,
    pub attributes: HashSet<String>,
    pub display_name: Option<String>,
}

impl ClientContext {
    pub fn anonymous() -> Self {
        ClientContext::default()
    }

    pub fn authenticated(client_id: impl Into<String>) -> Self {
        ClientContext {
            client_id: Some(client_id.into()),
            attributes: HashSet::new(),
            display_name: None,
        }
    }

    pub fn with_attribute(mut self, attr: impl Into<String>) -> Self {
        self.attributes.insert(attr.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.client_id.is_some()
    }

    /// All identifiers this context could match an ACL role against:
    /// its client id plus every attribute id.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.client_id
            .as_deref()
            .into_iter()
            .chain(self.attributes.iter().map(|s| s.as_str()))
    }
}
