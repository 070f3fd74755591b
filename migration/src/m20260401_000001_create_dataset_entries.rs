use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DatasetEntry::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DatasetEntry::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DatasetEntry::DatasetId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(DatasetEntry::Title).string().null())
                    .col(ColumnDef::new(DatasetEntry::Description).text().null())
                    .col(ColumnDef::new(DatasetEntry::BackendType).string().not_null())
                    .col(ColumnDef::new(DatasetEntry::BackendConfig).json().null())
                    .col(
                        ColumnDef::new(DatasetEntry::Expose)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(DatasetEntry::AccessLevel).string().null())
                    .col(ColumnDef::new(DatasetEntry::Lineage).json().null())
                    .col(ColumnDef::new(DatasetEntry::Publisher).string().null())
                    .col(ColumnDef::new(DatasetEntry::License).string().null())
                    .col(
                        ColumnDef::new(DatasetEntry::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DatasetEntry::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DatasetEntry::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DatasetEntry {
    Table,
    Id,
    DatasetId,
    Title,
    Description,
    BackendType,
    BackendConfig,
    Expose,
    AccessLevel,
    Lineage,
    Publisher,
    License,
    CreatedAt,
    UpdatedAt,
}
