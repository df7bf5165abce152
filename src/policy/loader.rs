use std::path::Path;

use crate::errors::PerimeterError;
use crate::policy::manifest::{parse_manifest, Manifest};
use crate::policy::types::{NewPolicy, PolicyPatch, RoleField};
use crate::storage::{self, Store, WriteTx};

/// What a manifest load changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub files: usize,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub policies_created: usize,
    pub policies_updated: usize,
}

impl LoadSummary {
    pub fn changed(&self) -> bool {
        self.entities_created
            + self.entities_updated
            + self.policies_created
            + self.policies_updated
            > 0
    }
}

/// Read and parse every `.kdl` file in `dir`, in path order.
pub fn read_manifests(dir: &Path) -> Result<(Manifest, usize), PerimeterError> {
    if !dir.is_dir() {
        return Err(PerimeterError::InvalidManifest(format!(
            "manifests directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    let mut manifest = Manifest::default();
    let mut file_count = 0;
    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| PerimeterError::ManifestLoad {
                path: path.display().to_string(),
                source,
            })?;
        manifest.extend(parse_manifest(&contents)?);
        file_count += 1;
    }

    Ok((manifest, file_count))
}

/// Create or update everything a manifest declares. Entities go first so
/// policies can reference them by name.
pub async fn apply_manifest(
    tx: &mut WriteTx<'_>,
    manifest: Manifest,
) -> Result<LoadSummary, PerimeterError> {
    let mut summary = LoadSummary::default();

    for decl in manifest.entities {
        match storage::find_entity_by_name(tx.conn(), decl.kind, &decl.name).await? {
            Some(existing) => {
                let mut wanted = decl.role_attributes.clone();
                wanted.sort();
                wanted.dedup();
                if wanted != existing.role_attributes {
                    storage::update_role_attributes(tx, decl.kind, &existing.id, wanted).await?;
                    summary.entities_updated += 1;
                }
            }
            None => {
                storage::create_entity(tx, decl.kind, &decl.name, decl.id, decl.role_attributes)
                    .await?;
                summary.entities_created += 1;
            }
        }
    }

    for decl in manifest.policies {
        match storage::find_policy_by_name(tx.conn(), decl.kind, &decl.name).await? {
            Some(existing) => {
                let mut patch = PolicyPatch::default();
                let mut differs = false;
                if decl.semantic != existing.semantic {
                    patch.semantic = Some(decl.semantic);
                    differs = true;
                }
                if decl.policy_type != existing.policy_type {
                    patch.policy_type = decl.policy_type;
                    differs = true;
                }
                for &field in decl.kind.role_fields() {
                    let wanted = declared_roles(&decl, field);
                    if wanted != existing.roles(field) {
                        patch = patch.with_roles(field, wanted.to_vec());
                        differs = true;
                    }
                }
                if differs {
                    storage::update_policy(tx, &existing.id, patch).await?;
                    summary.policies_updated += 1;
                }
            }
            None => {
                storage::create_policy(tx, decl).await?;
                summary.policies_created += 1;
            }
        }
    }

    Ok(summary)
}

fn declared_roles(decl: &NewPolicy, field: RoleField) -> &[String] {
    match field {
        RoleField::IdentityRoles => &decl.identity_roles,
        RoleField::ServiceRoles => &decl.service_roles,
        RoleField::EdgeRouterRoles => &decl.edge_router_roles,
        RoleField::PostureCheckRoles => &decl.posture_check_roles,
    }
}

/// Load a manifest directory in one write transaction.
pub async fn load_manifests(store: &Store, dir: &Path) -> Result<LoadSummary, PerimeterError> {
    let (manifest, files) = read_manifests(dir)?;
    if manifest.is_empty() {
        tracing::warn!(dir = %dir.display(), files, "Manifest directory declares nothing");
        return Ok(LoadSummary {
            files,
            ..LoadSummary::default()
        });
    }

    let mut tx = store.begin().await?;
    let mut summary = match apply_manifest(&mut tx, manifest).await {
        Ok(summary) => summary,
        Err(err) => {
            tx.rollback().await?;
            return Err(err);
        }
    };
    summary.files = files;
    let committed = tx.commit().await?;

    tracing::info!(
        files = summary.files,
        entities_created = summary.entities_created,
        entities_updated = summary.entities_updated,
        policies_created = summary.policies_created,
        policies_updated = summary.policies_updated,
        events = committed.events,
        "Loaded manifests"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_manifests_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.kdl"), r#"service "billing""#).unwrap();
        std::fs::write(dir.path().join("a.kdl"), r#"identity "alice""#).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

        let (manifest, files) = read_manifests(dir.path()).unwrap();
        assert_eq!(files, 2);
        let names: Vec<_> = manifest.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "billing"]);
    }

    #[test]
    fn test_read_nonexistent_directory() {
        let err = read_manifests(Path::new("/nonexistent/path")).unwrap_err();
        assert!(matches!(err, PerimeterError::InvalidManifest(_)));
    }
}
