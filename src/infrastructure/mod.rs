pub mod immich_client;
pub mod legacy_sqlite;
pub mod target_postgres;

pub use immich_client::ImmichClient;
pub use legacy_sqlite::LegacySqliteReader;
pub use target_postgres::TargetPostgresReader;
