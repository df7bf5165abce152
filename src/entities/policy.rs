use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "policies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub kind: String,
    pub name: String,
    pub semantic: String,            // "AllOf" | "AnyOf"
    pub policy_type: Option<String>, // "Dial" | "Bind", service policies only
    // Role sets, JSON arrays of role references
    pub identity_roles: String,
    pub service_roles: String,
    pub edge_router_roles: String,
    pub posture_check_roles: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
