pub use sea_orm_migration::prelude::*;

mod m20260401_000001_create_dataset_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20260401_000001_create_dataset_entries::Migration)]
    }
}
