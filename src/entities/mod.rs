pub mod denorm_link;
pub mod governed_entity;
pub mod job_execution;
pub mod policy;
pub mod policy_link;

pub use denorm_link::Entity as DenormLink;
pub use governed_entity::Entity as GovernedEntity;
pub use job_execution::Entity as JobExecution;
pub use policy::Entity as Policy;
pub use policy_link::Entity as PolicyLink;
