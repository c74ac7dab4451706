//! Initial migration to create the pacer database schema.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.create_subjects(manager).await?;
        self.create_activities(manager).await?;
        self.create_activity_streams(manager).await?;
        self.create_kv_state(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(KvState::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ActivityStreams::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Activities::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Subjects::Table).to_owned())
            .await?;
        Ok(())
    }
}

impl Migration {
    async fn create_subjects(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Subjects::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Subjects::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Subjects::Name).string().not_null())
                    .col(
                        ColumnDef::new(Subjects::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Subjects::IsSelf)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    // Sync cursors
                    .col(ColumnDef::new(Subjects::LastSyncTs).big_integer().null())
                    .col(
                        ColumnDef::new(Subjects::LastSyncErrorTs)
                            .big_integer()
                            .null(),
                    )
                    .col(ColumnDef::new(Subjects::LastSyncError).text().null())
                    .col(
                        ColumnDef::new(Subjects::LastAppliedManifestHash)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subjects::DiscoveryCursor)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subjects::DiscoverySentinel)
                            .big_integer()
                            .null(),
                    )
                    // Domain attributes
                    .col(
                        ColumnDef::new(Subjects::FtpHistory)
                            .json()
                            .not_null()
                            .default(Expr::cust("'[]'")),
                    )
                    .col(
                        ColumnDef::new(Subjects::WeightHistory)
                            .json()
                            .not_null()
                            .default(Expr::cust("'[]'")),
                    )
                    .col(ColumnDef::new(Subjects::CreatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn create_activities(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Activities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Activities::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Activities::SubjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Activities::Ts).big_integer().not_null())
                    .col(
                        ColumnDef::new(Activities::Kind)
                            .string()
                            .not_null()
                            .default("other"),
                    )
                    .col(ColumnDef::new(Activities::Name).string().not_null())
                    .col(
                        ColumnDef::new(Activities::ContentHash)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Activities::SyncState)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    .col(
                        ColumnDef::new(Activities::Stats)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    .col(
                        ColumnDef::new(Activities::Summary)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    .col(
                        ColumnDef::new(Activities::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Per-subject timeline scans (ordered by ts)
        manager
            .create_index(
                Index::create()
                    .name("idx_activities_subject_ts")
                    .table(Activities::Table)
                    .col(Activities::SubjectId)
                    .col(Activities::Ts)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_activity_streams(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ActivityStreams::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ActivityStreams::ActivityId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ActivityStreams::SubjectId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ActivityStreams::Data)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    .col(
                        ColumnDef::new(ActivityStreams::FetchedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_activity_streams_subject")
                    .table(ActivityStreams::Table)
                    .col(ActivityStreams::SubjectId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_kv_state(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(KvState::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(KvState::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(KvState::Value).json().not_null())
                    .col(ColumnDef::new(KvState::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
#[sea_orm(iden = "subjects")]
enum Subjects {
    Table,
    Id,
    Name,
    Enabled,
    IsSelf,
    LastSyncTs,
    LastSyncErrorTs,
    LastSyncError,
    LastAppliedManifestHash,
    DiscoveryCursor,
    DiscoverySentinel,
    FtpHistory,
    WeightHistory,
    CreatedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "activities")]
enum Activities {
    Table,
    Id,
    SubjectId,
    Ts,
    Kind,
    Name,
    ContentHash,
    SyncState,
    Stats,
    Summary,
    UpdatedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "activity_streams")]
enum ActivityStreams {
    Table,
    ActivityId,
    SubjectId,
    Data,
    FetchedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "kv_state")]
enum KvState {
    Table,
    Key,
    Value,
    UpdatedAt,
}
