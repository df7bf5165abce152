use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // First-order links: policy -> governed entity, per collection
        manager
            .create_table(
                Table::create()
                    .table(PolicyLinks::Table)
                    .if_not_exists()
                    .col(string(PolicyLinks::Collection))
                    .col(string(PolicyLinks::PolicyId))
                    .col(string(PolicyLinks::EntityId))
                    .primary_key(
                        Index::create()
                            .col(PolicyLinks::Collection)
                            .col(PolicyLinks::PolicyId)
                            .col(PolicyLinks::EntityId),
                    )
                    .to_owned(),
            )
            .await?;

        // Reverse direction: entity -> policies
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_policy_links_entity")
                    .table(PolicyLinks::Table)
                    .col(PolicyLinks::Collection)
                    .col(PolicyLinks::EntityId)
                    .col(PolicyLinks::PolicyId)
                    .to_owned(),
            )
            .await?;

        // Denormalized, reference-counted links: source -> target, per collection
        manager
            .create_table(
                Table::create()
                    .table(DenormLinks::Table)
                    .if_not_exists()
                    .col(string(DenormLinks::Collection))
                    .col(string(DenormLinks::SourceId))
                    .col(string(DenormLinks::TargetId))
                    .col(integer(DenormLinks::LinkCount))
                    .primary_key(
                        Index::create()
                            .col(DenormLinks::Collection)
                            .col(DenormLinks::SourceId)
                            .col(DenormLinks::TargetId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_denorm_links_target")
                    .table(DenormLinks::Table)
                    .col(DenormLinks::Collection)
                    .col(DenormLinks::TargetId)
                    .col(DenormLinks::SourceId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DenormLinks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PolicyLinks::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum PolicyLinks {
    Table,
    Collection,
    PolicyId,
    EntityId,
}

#[derive(DeriveIden)]
enum DenormLinks {
    Table,
    Collection,
    SourceId,
    TargetId,
    LinkCount,
}
