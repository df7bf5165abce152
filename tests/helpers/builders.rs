use perimeter::policy::{
    EntityKind, GovernedEntity, NewPolicy, Policy, PolicyKind, PolicyType, Semantic,
};
use perimeter::storage::{self, WriteTx};

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Builder for creating test identities, services, edge routers and posture checks
pub struct EntityBuilder {
    kind: EntityKind,
    name: String,
    id: Option<String>,
    role_attributes: Vec<String>,
}

impl EntityBuilder {
    pub fn new(kind: EntityKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            id: None,
            role_attributes: Vec::new(),
        }
    }

    pub fn identity(name: &str) -> Self {
        Self::new(EntityKind::Identity, name)
    }

    pub fn service(name: &str) -> Self {
        Self::new(EntityKind::Service, name)
    }

    pub fn edge_router(name: &str) -> Self {
        Self::new(EntityKind::EdgeRouter, name)
    }

    pub fn posture_check(name: &str) -> Self {
        Self::new(EntityKind::PostureCheck, name)
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.role_attributes = strings(roles);
        self
    }

    pub async fn create(self, tx: &mut WriteTx<'_>) -> GovernedEntity {
        storage::create_entity(tx, self.kind, &self.name, self.id, self.role_attributes)
            .await
            .expect("Failed to create test entity")
    }
}

/// Builder for creating test policies
pub struct PolicyBuilder {
    input: NewPolicy,
}

impl PolicyBuilder {
    pub fn new(kind: PolicyKind, name: &str) -> Self {
        Self {
            input: NewPolicy::new(kind, name),
        }
    }

    pub fn dial(name: &str) -> Self {
        Self::new(PolicyKind::ServicePolicy, name).with_type(PolicyType::Dial)
    }

    pub fn bind(name: &str) -> Self {
        Self::new(PolicyKind::ServicePolicy, name).with_type(PolicyType::Bind)
    }

    pub fn edge_router(name: &str) -> Self {
        Self::new(PolicyKind::EdgeRouterPolicy, name)
    }

    pub fn service_edge_router(name: &str) -> Self {
        Self::new(PolicyKind::ServiceEdgeRouterPolicy, name)
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.input.id = Some(id.to_string());
        self
    }

    pub fn with_type(mut self, policy_type: PolicyType) -> Self {
        self.input.policy_type = Some(policy_type);
        self
    }

    pub fn any_of(mut self) -> Self {
        self.input.semantic = Semantic::AnyOf;
        self
    }

    pub fn identity_roles(mut self, roles: &[&str]) -> Self {
        self.input.identity_roles = strings(roles);
        self
    }

    pub fn service_roles(mut self, roles: &[&str]) -> Self {
        self.input.service_roles = strings(roles);
        self
    }

    pub fn edge_router_roles(mut self, roles: &[&str]) -> Self {
        self.input.edge_router_roles = strings(roles);
        self
    }

    pub fn posture_check_roles(mut self, roles: &[&str]) -> Self {
        self.input.posture_check_roles = strings(roles);
        self
    }

    pub fn build(self) -> NewPolicy {
        self.input
    }

    pub async fn create(self, tx: &mut WriteTx<'_>) -> Policy {
        storage::create_policy(tx, self.input)
            .await
            .expect("Failed to create test policy")
    }
}
