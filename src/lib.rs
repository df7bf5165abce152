//! Perimeter - zero-trust network access policy engine
//!
//! Evaluates role-based policies against identities, services, edge routers
//! and posture checks, and keeps the resulting access links denormalized so
//! access checks are single lookups. It exposes all modules for testing
//! purposes.

pub mod entities;
pub mod errors;
pub mod jobs;
pub mod links;
pub mod policy;
pub mod settings;
pub mod storage;
