use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OpenidRegistration::Table)
                    .if_not_exists()
                    .col(string(OpenidRegistration::Name).primary_key().to_owned())
                    .col(
                        boolean(OpenidRegistration::Admin)
                            .default(false)
                            .not_null()
                            .to_owned(),
                    )
                    .col(
                        boolean(OpenidRegistration::Validated)
                            .default(false)
                            .not_null()
                            .to_owned(),
                    )
                    .col(
                        timestamp_with_time_zone(OpenidRegistration::CreatedAt)
                            .default(Expr::current_timestamp())
                            .not_null()
                            .to_owned(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OpenidRegistration::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum OpenidRegistration {
    Table,
    Name,
    Admin,
    Validated,
    CreatedAt,
}
