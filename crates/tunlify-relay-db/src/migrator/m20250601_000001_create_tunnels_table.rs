//! Create the tunnels table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tunnel::Table)
                    .if_not_exists()
                    .col(uuid(Tunnel::Id).primary_key())
                    .col(uuid(Tunnel::OwnerId).not_null())
                    .col(string_len_null(Tunnel::OwnerEmail, 255))
                    .col(string_len(Tunnel::Subdomain, 63).not_null())
                    .col(string_len(Tunnel::Region, 32).not_null())
                    .col(
                        string_len(Tunnel::ConnectionToken, 128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        string_len(Tunnel::Status, 16)
                            .not_null()
                            .default("inactive"),
                    )
                    .col(boolean(Tunnel::ClientConnected).not_null().default(false))
                    .col(
                        timestamp_with_time_zone(Tunnel::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(Tunnel::LastConnectedAt))
                    .to_owned(),
            )
            .await?;

        // (subdomain, region) identifies a tunnel publicly
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_subdomain_region")
                    .table(Tunnel::Table)
                    .col(Tunnel::Subdomain)
                    .col(Tunnel::Region)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_owner_id")
                    .table(Tunnel::Table)
                    .col(Tunnel::OwnerId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tunnel::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Tunnel {
    #[sea_orm(iden = "tunnels")]
    Table,
    Id,
    OwnerId,
    OwnerEmail,
    Subdomain,
    Region,
    ConnectionToken,
    Status,
    ClientConnected,
    CreatedAt,
    LastConnectedAt,
}
