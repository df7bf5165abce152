//! Role-based policy evaluation and link denormalization.

pub mod denorm;
pub mod evaluator;
pub mod events;
pub mod integrity;
pub mod loader;
pub mod manifest;
pub mod matcher;
pub mod roles;
pub mod types;

pub use events::{EventRegistry, ServiceEvent, ServiceEventType, SubscriptionId};
pub use integrity::{IntegrityReport, IntegrityViolation};
pub use types::{
    EntityKind, GovernedEntity, NewPolicy, Policy, PolicyKind, PolicyPatch, PolicyType, RoleField,
    Semantic,
};
