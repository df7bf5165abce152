use std::collections::HashSet;

use crate::policy::roles::RoleSet;
use crate::policy::types::{GovernedEntity, Semantic};

/// Decide whether a policy with the given semantic and role set governs
/// `entity`. Entity references match either the id or the name.
pub fn matches(semantic: Semantic, roles: &RoleSet, entity: &GovernedEntity) -> bool {
    if roles.all {
        return true;
    }

    if roles
        .entity_refs
        .iter()
        .any(|r| *r == entity.id || *r == entity.name)
    {
        return true;
    }

    attributes_match(semantic, &roles.attributes, &entity.role_attributes)
}

/// Attribute-only part of the match. Under `AllOf` an empty attribute list
/// never matches.
pub fn attributes_match(
    semantic: Semantic,
    attributes: &[String],
    role_attributes: &[String],
) -> bool {
    let held: HashSet<&str> = role_attributes.iter().map(String::as_str).collect();
    match semantic {
        Semantic::AllOf => {
            !attributes.is_empty() && attributes.iter().all(|a| held.contains(a.as_str()))
        }
        Semantic::AnyOf => attributes.iter().any(|a| held.contains(a.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::roles::split_roles;
    use crate::policy::types::EntityKind;
    use proptest::prelude::*;

    fn entity(id: &str, name: &str, attrs: &[&str]) -> GovernedEntity {
        GovernedEntity {
            id: id.into(),
            kind: EntityKind::Identity,
            name: name.into(),
            role_attributes: attrs.iter().map(|s| s.to_string()).collect(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn role_set(values: &[&str]) -> RoleSet {
        let values: Vec<String> = values.iter().map(|s| s.to_string()).collect();
        split_roles(&values).unwrap()
    }

    #[test]
    fn test_all_of_requires_every_attribute() {
        let e = entity("i1", "alice", &["eng", "ops"]);
        assert!(matches(Semantic::AllOf, &role_set(&["#eng"]), &e));
        assert!(matches(Semantic::AllOf, &role_set(&["#eng", "#ops"]), &e));
        assert!(!matches(Semantic::AllOf, &role_set(&["#eng", "#sales"]), &e));
    }

    #[test]
    fn test_any_of_requires_intersection() {
        let e = entity("i1", "alice", &["eng"]);
        assert!(matches(Semantic::AnyOf, &role_set(&["#eng", "#sales"]), &e));
        assert!(!matches(Semantic::AnyOf, &role_set(&["#sales"]), &e));
    }

    #[test]
    fn test_empty_attributes_never_match_by_attribute() {
        let e = entity("i1", "alice", &["eng"]);
        assert!(!matches(Semantic::AllOf, &role_set(&[]), &e));
        assert!(!matches(Semantic::AnyOf, &role_set(&[]), &e));
        assert!(!matches(Semantic::AllOf, &role_set(&["@someone-else"]), &e));
    }

    #[test]
    fn test_entity_ref_matches_id_or_name() {
        let e = entity("i1", "alice", &[]);
        assert!(matches(Semantic::AllOf, &role_set(&["@i1"]), &e));
        assert!(matches(Semantic::AllOf, &role_set(&["@alice"]), &e));
        // id match short-circuits a failing AllOf attribute test
        assert!(matches(Semantic::AllOf, &role_set(&["#missing", "@i1"]), &e));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        assert!(matches(Semantic::AllOf, &role_set(&["#all"]), &entity("x", "x", &[])));
        assert!(matches(Semantic::AnyOf, &role_set(&["#all"]), &entity("y", "y", &["z"])));
    }

    fn permutations(items: &[String]) -> Vec<Vec<String>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    proptest! {
        #[test]
        fn prop_match_is_permutation_invariant(
            roles in proptest::collection::vec(prop_oneof![
                "[a-d]".prop_map(|s| format!("#{s}")),
                Just("@i1".to_string()),
                Just("@nobody".to_string()),
            ], 0..4),
            attrs in proptest::collection::btree_set("[a-d]", 0..4),
            any_of in any::<bool>(),
        ) {
            let semantic = if any_of { Semantic::AnyOf } else { Semantic::AllOf };
            let attrs: Vec<String> = attrs.into_iter().collect();
            let baseline = matches(
                semantic,
                &split_roles(&roles).unwrap(),
                &GovernedEntity {
                    id: "i1".into(),
                    kind: EntityKind::Identity,
                    name: "n1".into(),
                    role_attributes: attrs.clone(),
                    created_at: 0,
                    updated_at: 0,
                },
            );

            for role_perm in permutations(&roles) {
                let set = split_roles(&role_perm).unwrap();
                for attr_perm in permutations(&attrs) {
                    let e = GovernedEntity {
                        id: "i1".into(),
                        kind: EntityKind::Identity,
                        name: "n1".into(),
                        role_attributes: attr_perm,
                        created_at: 0,
                        updated_at: 0,
                    };
                    prop_assert_eq!(matches(semantic, &set, &e), baseline);
                }
            }
        }
    }
}
