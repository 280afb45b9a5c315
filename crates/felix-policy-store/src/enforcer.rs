//! Casbin enforcer built from persisted rules.
//!
//! # Purpose
//! Bridges a loaded [`PolicySet`] into an in-memory Casbin enforcer so stored
//! rules can be evaluated. Decision logic stays inside Casbin.
//!
//! # Key invariants
//! - Every ptype is added under its own name, so models with several policy or
//!   role definitions (`p2`, `g2`) round-trip.
//! - Role links are rebuilt once after all rules are added.
use crate::model::{PolicyModel, PolicySet};
use crate::row::section_for;
use casbin::{CoreApi, DefaultModel, Enforcer, MemoryAdapter, MgmtApi, Result};

/// Classic RBAC model matching the rule shapes the adapter stores:
/// `p = sub, obj, act` and `g = _, _`.
pub const RBAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
"#;

/// Build an in-memory enforcer for `model_conf` seeded with `rules`.
///
/// # Errors
/// - Returns Casbin errors for an invalid model or rules that do not fit it.
///
/// # Example
/// ```rust
/// use felix_policy_store::enforcer::{RBAC_MODEL, build_enforcer};
/// use felix_policy_store::PolicySet;
/// use casbin::CoreApi;
///
/// # async fn build() -> casbin::Result<()> {
/// let mut rules = PolicySet::new();
/// rules.add_rule("p", &["alice", "data1", "read"]);
/// let enforcer = build_enforcer(RBAC_MODEL, &rules).await?;
/// assert!(enforcer.enforce(("alice", "data1", "read"))?);
/// # Ok(())
/// # }
/// ```
pub async fn build_enforcer(model_conf: &str, rules: &PolicySet) -> Result<Enforcer> {
    let model = DefaultModel::from_str(model_conf).await?;
    let mut enforcer = Enforcer::new(model, MemoryAdapter::default()).await?;

    for (ptype, rule) in rules.policy_lines() {
        if section_for(&ptype) == "g" {
            enforcer.add_named_grouping_policy(&ptype, rule).await?;
        } else {
            enforcer.add_named_policy(&ptype, rule).await?;
        }
    }

    enforcer.build_role_links()?;
    Ok(enforcer)
}
