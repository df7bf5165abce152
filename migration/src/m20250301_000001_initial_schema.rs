use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Identities, services, edge routers and posture checks share one table
        manager
            .create_table(
                Table::create()
                    .table(GovernedEntities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(GovernedEntities::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(GovernedEntities::Kind))
                    .col(string(GovernedEntities::Name))
                    .col(string(GovernedEntities::RoleAttributes))
                    .col(big_integer(GovernedEntities::CreatedAt))
                    .col(big_integer(GovernedEntities::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_governed_entities_kind_name")
                    .table(GovernedEntities::Table)
                    .col(GovernedEntities::Kind)
                    .col(GovernedEntities::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Policies::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Policies::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Policies::Kind))
                    .col(string(Policies::Name))
                    .col(string(Policies::Semantic))
                    .col(string_null(Policies::PolicyType))
                    .col(string(Policies::IdentityRoles))
                    .col(string(Policies::ServiceRoles))
                    .col(string(Policies::EdgeRouterRoles))
                    .col(string(Policies::PostureCheckRoles))
                    .col(big_integer(Policies::CreatedAt))
                    .col(big_integer(Policies::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_policies_kind_name")
                    .table(Policies::Table)
                    .col(Policies::Kind)
                    .col(Policies::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Policies::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(GovernedEntities::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum GovernedEntities {
    Table,
    Id,
    Kind,
    Name,
    RoleAttributes,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Policies {
    Table,
    Id,
    Kind,
    Name,
    Semantic,
    PolicyType,
    IdentityRoles,
    ServiceRoles,
    EdgeRouterRoles,
    PostureCheckRoles,
    CreatedAt,
    UpdatedAt,
}
