use sqlx::migrate::Migrator;

/// 仓库根目录下 `migrations/` 中的 SQL 迁移
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
