#![allow(dead_code)]

pub mod builders;
pub mod db;
pub mod events;

pub use builders::{EntityBuilder, PolicyBuilder};
pub use db::{commit, TestDb};
pub use events::EventRecorder;
