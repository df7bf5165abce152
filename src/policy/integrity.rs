//! Out-of-band re-derivation of link state.
//!
//! Neither pass relies on the incremental path: first-order links are
//! recomputed from role sets and role attributes, and denormalized counts are
//! recomputed from the first-order links of every policy.

use std::collections::{BTreeMap, BTreeSet};

use sea_orm::ConnectionTrait;
use thiserror::Error;

use crate::errors::PerimeterError;
use crate::policy::denorm::{self, Denormalization, PolicyConfig};
use crate::policy::evaluator;
use crate::policy::types::{PolicyKind, RoleField};
use crate::storage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("{collection}: policy `{policy_id}` should be linked to `{entity_id}`")]
    MissingLink {
        collection: &'static str,
        policy_id: String,
        entity_id: String,
    },

    #[error("{collection}: policy `{policy_id}` should not be linked to `{entity_id}`")]
    UnexpectedLink {
        collection: &'static str,
        policy_id: String,
        entity_id: String,
    },

    #[error("{collection}: `{source_id}` -> `{target_id}` has count {actual}, expected {expected}")]
    CountMismatch {
        collection: &'static str,
        source_id: String,
        target_id: String,
        expected: i32,
        actual: i32,
    },

    #[error("policy `{policy_id}` {field} cannot be evaluated: {reason}")]
    Unevaluable {
        policy_id: String,
        field: RoleField,
        reason: String,
    },
}

/// Collected `(violation, fixed)` pairs, for callers that prefer a value
/// over a callback.
#[derive(Debug, Default, Clone)]
pub struct IntegrityReport {
    pub entries: Vec<(IntegrityViolation, bool)>,
}

impl IntegrityReport {
    pub fn record(&mut self, violation: IntegrityViolation, fixed: bool) {
        self.entries.push((violation, fixed));
    }

    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unfixed(&self) -> usize {
        self.entries.iter().filter(|(_, fixed)| !fixed).count()
    }
}

/// Run both passes. Discrepancies go to `sink`; only I/O failures are
/// returned as errors.
pub async fn check_integrity<C, F>(db: &C, repair: bool, mut sink: F) -> Result<(), PerimeterError>
where
    C: ConnectionTrait,
    F: FnMut(IntegrityViolation, bool),
{
    check_links(db, repair, &mut sink).await?;

    for config in denorm::ALL_CONFIGS {
        for denormalization in config.denormalizations {
            check_denormalization(db, config, denormalization, repair, &mut sink).await?;
        }
    }
    Ok(())
}

pub async fn report<C: ConnectionTrait>(
    db: &C,
    repair: bool,
) -> Result<IntegrityReport, PerimeterError> {
    let mut report = IntegrityReport::default();
    check_integrity(db, repair, |violation, fixed| report.record(violation, fixed)).await?;
    Ok(report)
}

/// First-order pass. Repairs touch only the link collections.
pub async fn check_links<C, F>(db: &C, repair: bool, sink: &mut F) -> Result<(), PerimeterError>
where
    C: ConnectionTrait,
    F: FnMut(IntegrityViolation, bool),
{
    for kind in PolicyKind::ALL {
        let policies = storage::list_policies(db, kind).await?;

        for &field in kind.role_fields() {
            let links = denorm::links_for(kind, field);
            let mut live: BTreeSet<(String, String)> = links.all(db).await?.into_iter().collect();

            for policy in &policies {
                let expected = match evaluator::matching_entities(db, policy, field).await {
                    Ok(expected) => expected,
                    Err(err @ PerimeterError::Db(_)) => return Err(err),
                    Err(err) => {
                        sink(
                            IntegrityViolation::Unevaluable {
                                policy_id: policy.id.clone(),
                                field,
                                reason: err.to_string(),
                            },
                            false,
                        );
                        live.retain(|(policy_id, _)| *policy_id != policy.id);
                        continue;
                    }
                };

                for entity_id in expected {
                    if live.remove(&(policy.id.clone(), entity_id.clone())) {
                        continue;
                    }
                    if repair {
                        links.add(db, &policy.id, &entity_id).await?;
                    }
                    sink(
                        IntegrityViolation::MissingLink {
                            collection: links.name(),
                            policy_id: policy.id.clone(),
                            entity_id,
                        },
                        repair,
                    );
                }
            }

            // Whatever is left is not produced by any current policy
            for (policy_id, entity_id) in live {
                if repair {
                    links.remove(db, &policy_id, &entity_id).await?;
                }
                sink(
                    IntegrityViolation::UnexpectedLink {
                        collection: links.name(),
                        policy_id,
                        entity_id,
                    },
                    repair,
                );
            }
        }
    }
    Ok(())
}

/// Second-order pass for one denormalization, restricted to policies of the
/// config's kind and type.
pub async fn check_denormalization<C, F>(
    db: &C,
    config: &PolicyConfig,
    denormalization: &Denormalization,
    repair: bool,
    sink: &mut F,
) -> Result<(), PerimeterError>
where
    C: ConnectionTrait,
    F: FnMut(IntegrityViolation, bool),
{
    let mut expected: BTreeMap<(String, String), i32> = BTreeMap::new();

    for policy in storage::list_policies(db, config.kind).await? {
        if policy.policy_type != config.policy_type {
            continue;
        }
        let sources = denormalization.source.iterate(db, &policy.id).await?;
        if sources.is_empty() {
            continue;
        }
        let targets = denormalization.target.iterate(db, &policy.id).await?;
        for source_id in &sources {
            for target_id in &targets {
                *expected
                    .entry((source_id.clone(), target_id.clone()))
                    .or_insert(0) += 1;
            }
        }
    }

    let collection = denormalization.denorm;
    let mut live: BTreeMap<(String, String), i32> = collection
        .all(db)
        .await?
        .into_iter()
        .map(|(source_id, target_id, count)| ((source_id, target_id), count))
        .collect();

    let mut mismatches = Vec::new();
    for (key, want) in expected {
        let have = live.remove(&key).unwrap_or(0);
        if have != want {
            mismatches.push((key, want, have));
        }
    }
    mismatches.extend(live.into_iter().map(|(key, have)| (key, 0, have)));

    for ((source_id, target_id), want, have) in mismatches {
        if repair {
            collection.set_count(db, &source_id, &target_id, want).await?;
        }
        sink(
            IntegrityViolation::CountMismatch {
                collection: collection.name(),
                source_id,
                target_id,
                expected: want,
                actual: have,
            },
            repair,
        );
    }
    Ok(())
}
