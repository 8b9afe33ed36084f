use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS afk (
        user_id INTEGER NOT NULL,
        scope INTEGER NOT NULL,
        reason TEXT NOT NULL,
        since INTEGER NOT NULL,
        mentions INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, scope)
    )",
    "CREATE TABLE IF NOT EXISTS leveling_settings (
        guild_id INTEGER PRIMARY KEY,
        enabled INTEGER NOT NULL DEFAULT 1,
        announce_channel_id INTEGER,
        xp_min INTEGER NOT NULL DEFAULT 15,
        xp_max INTEGER NOT NULL DEFAULT 25,
        cooldown_secs INTEGER NOT NULL DEFAULT 60
    )",
    "CREATE TABLE IF NOT EXISTS levels (
        guild_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        xp INTEGER NOT NULL DEFAULT 0,
        level INTEGER NOT NULL DEFAULT 0,
        last_xp_at INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (guild_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS level_rewards (
        guild_id INTEGER NOT NULL,
        level INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        PRIMARY KEY (guild_id, level)
    )",
    "CREATE TABLE IF NOT EXISTS economy (
        user_id INTEGER PRIMARY KEY,
        balance INTEGER NOT NULL DEFAULT 0,
        last_daily INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS warnings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guild_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        moderator_id INTEGER NOT NULL,
        reason TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS log_settings (
        guild_id INTEGER PRIMARY KEY,
        channel_id INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ticket_settings (
        guild_id INTEGER PRIMARY KEY,
        category_id INTEGER NOT NULL,
        staff_role_id INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS open_tickets (
        channel_id INTEGER PRIMARY KEY,
        guild_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        opened_at INTEGER NOT NULL,
        UNIQUE (guild_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS verification_settings (
        guild_id INTEGER PRIMARY KEY,
        role_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ai_settings (
        guild_id INTEGER PRIMARY KEY,
        channel_id INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS reminders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        message TEXT NOT NULL,
        remind_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        reply_to_message_id INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_levels_guild_xp ON levels (guild_id, xp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_warnings_member ON warnings (guild_id, user_id)",
    "CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders (remind_at)",
];

/// Open the shared pool and make sure every table exists.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    create_tables(&pool).await?;
    log::info!("Database ready at {}", database_url);
    Ok(pool)
}

pub async fn create_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Discord snowflakes fit in 63 bits, so they round-trip through SQLite's i64.
pub fn id(snowflake: u64) -> i64 {
    snowflake as i64
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    create_tables(&pool).await.expect("schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_tables_is_idempotent() {
        let pool = test_pool().await;
        create_tables(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 12);
    }

    #[test]
    fn test_snowflake_conversion() {
        assert_eq!(id(398107630524039170), 398107630524039170i64);
    }
}
