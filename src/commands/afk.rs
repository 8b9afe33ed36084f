use crate::db::id;
use crate::utils::{format_duration, now_ts, truncate};
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use sqlx::SqlitePool;
use std::collections::HashSet;

const GLOBAL_SCOPE: i64 = 0;
const MAX_REASON_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct AfkEntry {
    scope: i64,
    reason: String,
    since: i64,
    mentions: i64,
}

async fn set_afk(
    pool: &SqlitePool,
    user_id: u64,
    scope: i64,
    reason: &str,
    since: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO afk (user_id, scope, reason, since, mentions) VALUES (?, ?, ?, ?, 0)",
    )
    .bind(id(user_id))
    .bind(scope)
    .bind(reason)
    .bind(since)
    .execute(pool)
    .await?;
    Ok(())
}

/// Entries that apply inside `guild_id`: the global one and the guild's own.
async fn entries_for(
    pool: &SqlitePool,
    user_id: u64,
    guild_id: u64,
) -> Result<Vec<AfkEntry>, sqlx::Error> {
    sqlx::query_as(
        "SELECT scope, reason, since, mentions FROM afk WHERE user_id = ? AND scope IN (?, ?) ORDER BY scope",
    )
    .bind(id(user_id))
    .bind(GLOBAL_SCOPE)
    .bind(id(guild_id))
    .fetch_all(pool)
    .await
}

async fn clear_afk(pool: &SqlitePool, user_id: u64, guild_id: u64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM afk WHERE user_id = ? AND scope IN (?, ?)")
        .bind(id(user_id))
        .bind(GLOBAL_SCOPE)
        .bind(id(guild_id))
        .execute(pool)
        .await?;
    Ok(())
}

async fn record_mention(pool: &SqlitePool, user_id: u64, guild_id: u64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE afk SET mentions = mentions + 1 WHERE user_id = ? AND scope IN (?, ?)")
        .bind(id(user_id))
        .bind(GLOBAL_SCOPE)
        .bind(id(guild_id))
        .execute(pool)
        .await?;
    Ok(())
}

/// Let others know you're away; cleared by your next message
#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn afk(
    ctx: Context<'_>,
    #[description = "Set AFK in every server, not just this one"]
    #[flag]
    global: bool,
    #[description = "Why you're away"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    log::info!(
        "AFK command called by {} (global: {})",
        ctx.author().name,
        global
    );

    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let reason = reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "AFK".to_string());
    let reason = truncate(&reason, MAX_REASON_LEN);
    let scope = if global { GLOBAL_SCOPE } else { id(guild_id.get()) };

    set_afk(&ctx.data().db, ctx.author().id.get(), scope, &reason, now_ts()).await?;

    let where_text = if global { "everywhere" } else { "in this server" };
    ctx.say(format!(
        "💤 **{}** is now AFK {where_text}: {reason}",
        ctx.author().name
    ))
    .await?;
    Ok(())
}

/// Whether a message sent at `sent_at` ends the author's AFK, giving the
/// oldest `since` and the mention count. The message that set AFK arrives here
/// too, so only later messages count. Every mention bumps all applicable
/// rows, so the largest counter is the total.
fn returning_from(entries: &[AfkEntry], sent_at: i64) -> Option<(i64, i64)> {
    let oldest = entries.iter().map(|e| e.since).min()?;
    if sent_at <= oldest {
        return None;
    }
    let mentions = entries.iter().map(|e| e.mentions).max().unwrap_or(0);
    Some((oldest, mentions))
}

/// Welcome back AFK authors and answer mentions of AFK members.
pub async fn on_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    let guild_id = guild_id.get();
    let pool = &data.db;
    let author_id = msg.author.id.get();

    let own = entries_for(pool, author_id, guild_id).await?;
    let sent_at = msg.timestamp.unix_timestamp();
    if let Some((oldest, mentions)) = returning_from(&own, sent_at) {
        clear_afk(pool, author_id, guild_id).await?;
        let away = format_duration(chrono::Duration::seconds(sent_at - oldest));
        msg.reply(
            &ctx.http,
            format!("👋 Welcome back! You were away for **{away}** and got mentioned **{mentions}** time(s)."),
        )
        .await?;
    }

    let mut seen = HashSet::new();
    let mut notes = Vec::new();
    for user in &msg.mentions {
        if user.bot || user.id == msg.author.id || !seen.insert(user.id) {
            continue;
        }
        let entries = entries_for(pool, user.id.get(), guild_id).await?;
        // The guild-specific entry wins over the global one
        let Some(entry) = entries.iter().max_by_key(|e| e.scope != GLOBAL_SCOPE) else {
            continue;
        };
        record_mention(pool, user.id.get(), guild_id).await?;
        notes.push(format!(
            "💤 **{}** is AFK: {} (<t:{}:R>)",
            user.name, entry.reason, entry.since
        ));
    }

    if !notes.is_empty() {
        msg.reply(&ctx.http, notes.join("\n")).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_scoped_entries() {
        let pool = test_pool().await;
        set_afk(&pool, 1, GLOBAL_SCOPE, "sleeping", 100).await.unwrap();
        set_afk(&pool, 1, 55, "lunch", 200).await.unwrap();
        set_afk(&pool, 1, 66, "other server", 300).await.unwrap();

        let entries = entries_for(&pool, 1, 55).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reason, "sleeping");
        assert_eq!(entries[1].reason, "lunch");

        clear_afk(&pool, 1, 55).await.unwrap();
        assert!(entries_for(&pool, 1, 55).await.unwrap().is_empty());
        assert_eq!(entries_for(&pool, 1, 66).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_only_later_messages_end_afk() {
        let pool = test_pool().await;
        set_afk(&pool, 3, 88, "brb", 1_000).await.unwrap();
        let entries = entries_for(&pool, 3, 88).await.unwrap();

        assert_eq!(returning_from(&entries, 999), None);
        assert_eq!(returning_from(&entries, 1_000), None);
        assert_eq!(returning_from(&entries, 1_001), Some((1_000, 0)));
        assert_eq!(returning_from(&[], 5_000), None);
    }

    #[tokio::test]
    async fn test_mentions_not_double_counted_across_scopes() {
        let pool = test_pool().await;
        set_afk(&pool, 4, GLOBAL_SCOPE, "away", 100).await.unwrap();
        set_afk(&pool, 4, 99, "away here", 200).await.unwrap();
        record_mention(&pool, 4, 99).await.unwrap();
        record_mention(&pool, 4, 99).await.unwrap();

        let entries = entries_for(&pool, 4, 99).await.unwrap();
        assert_eq!(returning_from(&entries, 300), Some((100, 2)));
    }

    #[tokio::test]
    async fn test_mentions_counted_and_reset() {
        let pool = test_pool().await;
        set_afk(&pool, 2, 77, "busy", 100).await.unwrap();
        record_mention(&pool, 2, 77).await.unwrap();
        record_mention(&pool, 2, 77).await.unwrap();
        assert_eq!(entries_for(&pool, 2, 77).await.unwrap()[0].mentions, 2);

        set_afk(&pool, 2, 77, "busy again", 150).await.unwrap();
        let entry = &entries_for(&pool, 2, 77).await.unwrap()[0];
        assert_eq!(entry.mentions, 0);
        assert_eq!(entry.since, 150);
    }
}
