use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PerimeterError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(perimeter::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(perimeter::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(perimeter::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(perimeter::db))]
    Db(#[from] sea_orm::DbErr),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Field(#[from] FieldError),

    #[error("{kind} `{id}` not found")]
    #[diagnostic(code(perimeter::not_found))]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} named `{name}` already exists")]
    #[diagnostic(
        code(perimeter::conflict),
        help("Names are unique per kind; update the existing record instead")
    )]
    Conflict { kind: &'static str, name: String },

    #[error("Failed to load manifest `{path}`")]
    #[diagnostic(
        code(perimeter::manifest_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    ManifestLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest: {0}")]
    #[diagnostic(
        code(perimeter::invalid_manifest),
        help("Top-level nodes are identity, service, edge-router, posture-check, service-policy, edge-router-policy and service-edge-router-policy")
    )]
    InvalidManifest(String),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(perimeter::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev")
    )]
    KdlParse(String),

    #[error("{0}")]
    #[diagnostic(code(perimeter::other))]
    Other(String),
}

/// A rejected field value. Messages are part of the public contract and are
/// matched verbatim by API clients.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("the value '{value}' for '{field}' is invalid: {reason}")]
#[diagnostic(code(perimeter::field))]
pub struct FieldError {
    pub reason: String,
    pub field: String,
    pub value: String,
}

impl FieldError {
    pub fn new(reason: impl Into<String>, field: impl Into<String>, values: &[String]) -> Self {
        Self {
            reason: reason.into(),
            field: field.into(),
            value: format!("[{}]", values.join(" ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_error_display() {
        let err = FieldError::new(
            "if using #all, it should be the only role specified",
            "identityRoles",
            &["#all".to_string(), "#other".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "the value '[#all #other]' for 'identityRoles' is invalid: if using #all, it should be the only role specified"
        );
    }

    #[test]
    fn test_field_error_converts() {
        let err: PerimeterError = FieldError::new("bad", "serviceRoles", &[]).into();
        assert!(matches!(err, PerimeterError::Field(ref f) if f.field == "serviceRoles"));
    }
}
