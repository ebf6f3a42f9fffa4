//! ACL engine (C2, §4.2).
//!
//! Each resource carries a direct ACL (a few access names, depending on
//! its kind) plus inherited "ancestor" access rolled up from proper
//! ancestors' "subtree" grants. The owning object of a version is
//! treated as one more proper ancestor for that rollup, which is why
//! versions additionally see `ancestor_owner`/`ancestor_read` pulled
//! from the object's own `subtree-owner`/`subtree-read`.

use crate::context::ClientContext;
use crate::errors::ErrorKind;
use crate::model::{Access, Acl, RoleSet};

/// One alternative in an `enforce` check: either a directly-held access
/// on the resource itself, or one of the four ancestor rollups.
#[derive(Debug, Clone, Copy)]
pub enum Requirement {
    Direct(Access),
    AncestorOwner,
    AncestorCreate,
    AncestorRead,
    AncestorUpdate,
}

fn roles_for(requirement: Requirement, direct: &Acl, ancestor_acls: &[&Acl]) -> RoleSet {
    match requirement {
        Requirement::Direct(access) => direct.get(&access).cloned().unwrap_or_default(),
        Requirement::AncestorOwner => union_subtree(ancestor_acls, Access::SubtreeOwner),
        Requirement::AncestorCreate => union_subtree(ancestor_acls, Access::SubtreeCreate),
        Requirement::AncestorRead => union_subtree(ancestor_acls, Access::SubtreeRead),
        Requirement::AncestorUpdate => union_subtree(ancestor_acls, Access::SubtreeUpdate),
    }
}

fn union_subtree(ancestor_acls: &[&Acl], access: Access) -> RoleSet {
    let mut roles = RoleSet::new();
    for acl in ancestor_acls {
        if let Some(set) = acl.get(&access) {
            roles.extend(set.iter().cloned());
        }
    }
    roles
}

/// Does `ctx` match any role in `roles` (literal `"*"`, client id, or any
/// attribute id)?
fn matches(roles: &RoleSet, ctx: &ClientContext) -> bool {
    if roles.contains("*") {
        return true;
    }
    ctx.identities().any(|id| roles.contains(id))
}

/// Check `ctx` against the union of every listed requirement's role set
/// (direct ACLs plus inherited ancestor rollups), across `direct` and
/// `ancestor_acls` (proper ancestors, any order; for a version, include
/// the owning object's ACL in this slice).
///
/// Accepts if `"*"` is present, the caller's client id is present, or
/// any of the caller's attribute ids are present. Otherwise fails with
/// `Forbidden` if authenticated, `Unauthenticated` otherwise.
pub fn enforce(
    requirements: &[Requirement],
    direct: &Acl,
    ancestor_acls: &[&Acl],
    ctx: &ClientContext,
) -> Result<(), ErrorKind> {
    for requirement in requirements {
        let roles = roles_for(*requirement, direct, ancestor_acls);
        if matches(&roles, ctx) {
            return Ok(());
        }
    }
    if ctx.is_authenticated() {
        Err(ErrorKind::Forbidden("access denied".into()))
    } else {
        Err(ErrorKind::Unauthenticated)
    }
}

/// Per-operation firewall check (§6 `firewall_acls`), gating `create`,
/// `delete`, `manage_acl`, and `manage_metadata` requests in addition to
/// (not instead of) whatever per-resource ACL check the operation also
/// performs. `roles` is the configured role list for the operation being
/// attempted; `"*"` matches any caller, same as a resource ACL role.
pub fn enforce_firewall(roles: &[String], ctx: &ClientContext) -> Result<(), ErrorKind> {
    if roles.iter().any(|r| r == "*") || ctx.identities().any(|id| roles.iter().any(|r| r == id)) {
        return Ok(());
    }
    if ctx.is_authenticated() {
        Err(ErrorKind::Forbidden("access denied by firewall policy".into()))
    } else {
        Err(ErrorKind::Unauthenticated)
    }
}

/// Add `role` to the role set for `access`. Idempotent (duplicates
/// collapse per the ACL invariants in §3).
pub fn set_role(acl: &mut Acl, access: Access, role: &str) {
    acl.entry(access).or_default().insert(role.to_string());
}

/// Remove `role` from the role set for `access`. `NotFound` if the role
/// was not present (§4.2 "`drop_role` on a role not in the set fails
/// `NotFound`"). This is a plain `HashSet::remove`: one revision of the
/// original implementation called an append here instead of a removal,
/// which spec.md's Open Question (a) calls a bug; this implements the
/// corrected (removal) semantics.
pub fn drop_role(acl: &mut Acl, access: Access, role: &str) -> Result<(), ErrorKind> {
    let present = acl.get_mut(&access).map(|set| set.remove(role)).unwrap_or(false);
    if present {
        Ok(())
    } else {
        Err(ErrorKind::NotFound(format!(
            "role '{role}' not present in access '{}'",
            access.as_str()
        )))
    }
}

/// Replace the entire role set for `access`.
pub fn set(acl: &mut Acl, access: Access, roles: RoleSet) {
    acl.insert(access, roles);
}

/// Clear the role set for `access` (empty, not absent).
pub fn clear(acl: &mut Acl, access: Access) {
    acl.insert(access, RoleSet::new());
}

/// Recognized direct access names for each resource kind (§4.2 table);
/// anything outside this list is a `BadRequest` at the REST edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Namespace,
    Object,
    Version,
    Upload,
}

pub fn recognized_direct_accesses(kind: ResourceKind) -> &'static [Access] {
    match kind {
        ResourceKind::Namespace => &[
            Access::Owner,
            Access::Create,
            Access::SubtreeOwner,
            Access::SubtreeCreate,
            Access::SubtreeRead,
            Access::SubtreeUpdate,
        ],
        ResourceKind::Object => &[
            Access::Owner,
            Access::Update,
            Access::Read,
            Access::SubtreeOwner,
            Access::SubtreeRead,
        ],
        ResourceKind::Version => &[Access::Owner, Access::Read],
        ResourceKind::Upload => &[Access::Owner],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::owner_acl;

    fn ctx(id: &str) -> ClientContext {
        ClientContext::authenticated(id)
    }

    #[test]
    fn owner_matches_own_acl() {
        let acl = owner_acl("alice");
        let result = enforce(&[Requirement::Direct(Access::Owner)], &acl, &[], &ctx("alice"));
        assert!(result.is_ok());
    }

    #[test]
    fn non_owner_is_forbidden() {
        let acl = owner_acl("alice");
        let result = enforce(&[Requirement::Direct(Access::Owner)], &acl, &[], &ctx("bob"));
        assert!(matches!(result, Err(ErrorKind::Forbidden(_))));
    }

    #[test]
    fn anonymous_is_unauthenticated() {
        let acl = owner_acl("alice");
        let result = enforce(
            &[Requirement::Direct(Access::Owner)],
            &acl,
            &[],
            &ClientContext::anonymous(),
        );
        assert!(matches!(result, Err(ErrorKind::Unauthenticated)));
    }

    #[test]
    fn wildcard_matches_any_caller() {
        let mut acl = Acl::new();
        set_role(&mut acl, Access::Read, "*");
        let result = enforce(&[Requirement::Direct(Access::Read)], &acl, &[], &ctx("anyone"));
        assert!(result.is_ok());
    }

    #[test]
    fn ancestor_owner_rolls_up_subtree_owner() {
        let direct = Acl::new();
        let mut parent = Acl::new();
        set_role(&mut parent, Access::SubtreeOwner, "alice");
        let ancestors: Vec<&Acl> = vec![&parent];

        let result = enforce(&[Requirement::AncestorOwner], &direct, &ancestors, &ctx("alice"));
        assert!(result.is_ok());
    }

    #[test]
    fn ancestor_rollup_is_a_union_over_ancestors() {
        let direct = Acl::new();
        let mut grandparent = Acl::new();
        set_role(&mut grandparent, Access::SubtreeRead, "carol");
        let mut parent = Acl::new();
        set_role(&mut parent, Access::SubtreeRead, "bob");
        let ancestors: Vec<&Acl> = vec![&grandparent, &parent];

        assert!(enforce(&[Requirement::AncestorRead], &direct, &ancestors, &ctx("carol")).is_ok());
        assert!(enforce(&[Requirement::AncestorRead], &direct, &ancestors, &ctx("bob")).is_ok());
        assert!(enforce(&[Requirement::AncestorRead], &direct, &ancestors, &ctx("dave")).is_err());
    }

    #[test]
    fn drop_role_not_present_is_not_found() {
        let mut acl = owner_acl("alice");
        let result = drop_role(&mut acl, Access::Owner, "bob");
        assert!(matches!(result, Err(ErrorKind::NotFound(_))));
    }

    #[test]
    fn drop_role_removes_existing_role() {
        let mut acl = owner_acl("alice");
        drop_role(&mut acl, Access::Owner, "alice").unwrap();
        assert!(enforce(&[Requirement::Direct(Access::Owner)], &acl, &[], &ctx("alice")).is_err());
    }

    #[test]
    fn firewall_wildcard_matches_any_caller() {
        let roles = vec!["*".to_string()];
        assert!(enforce_firewall(&roles, &ClientContext::anonymous()).is_ok());
        assert!(enforce_firewall(&roles, &ctx("anyone")).is_ok());
    }

    #[test]
    fn firewall_locked_down_rejects_unlisted_caller() {
        let roles = vec!["admin".to_string()];
        assert!(enforce_firewall(&roles, &ctx("admin")).is_ok());
        assert!(matches!(
            enforce_firewall(&roles, &ctx("bob")),
            Err(ErrorKind::Forbidden(_))
        ));
        assert!(matches!(
            enforce_firewall(&roles, &ClientContext::anonymous()),
            Err(ErrorKind::Unauthenticated)
        ));
    }

    #[test]
    fn monotone_in_granted_attributes() {
        // Adding a role to an ACL never removes previously granted access
        // (testable property 4 in spec.md §8).
        let mut acl = owner_acl("alice");
        assert!(enforce(&[Requirement::Direct(Access::Owner)], &acl, &[], &ctx("alice")).is_ok());
        set_role(&mut acl, Access::Owner, "bob");
        assert!(enforce(&[Requirement::Direct(Access::Owner)], &acl, &[], &ctx("alice")).is_ok());
        assert!(enforce(&[Requirement::Direct(Access::Owner)], &acl, &[], &ctx("bob")).is_ok());
    }
}
