use crate::db::id;
use crate::utils::{format_duration, now_ts, parse_duration};
use crate::{Context, Error};
use chrono::Duration;
use poise::serenity_prelude as serenity;
use serenity::{Color, CreateEmbed, CreateEmbedFooter};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration};

const CHECK_INTERVAL_SECS: u64 = 30;
const LIST_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct Reminder {
    id: i64,
    user_id: i64,
    channel_id: i64,
    message: String,
    remind_at: i64,
    created_at: i64,
    reply_to_message_id: Option<i64>,
}

struct NewReminder<'a> {
    user_id: u64,
    channel_id: u64,
    message: &'a str,
    remind_at: i64,
    created_at: i64,
    reply_to_message_id: Option<u64>,
}

async fn insert_reminder(pool: &SqlitePool, reminder: NewReminder<'_>) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO reminders (user_id, channel_id, message, remind_at, created_at, reply_to_message_id)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id(reminder.user_id))
    .bind(id(reminder.channel_id))
    .bind(reminder.message)
    .bind(reminder.remind_at)
    .bind(reminder.created_at)
    .bind(reminder.reply_to_message_id.map(id))
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn pending_for(pool: &SqlitePool, user_id: u64, now: i64) -> Result<Vec<Reminder>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, user_id, channel_id, message, remind_at, created_at, reply_to_message_id
         FROM reminders WHERE user_id = ? AND remind_at > ? ORDER BY remind_at",
    )
    .bind(id(user_id))
    .bind(now)
    .fetch_all(pool)
    .await
}

/// Deletes only the caller's own reminder.
async fn delete_reminder(pool: &SqlitePool, user_id: u64, reminder_id: i64) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("DELETE FROM reminders WHERE id = ? AND user_id = ? RETURNING message")
        .bind(reminder_id)
        .bind(id(user_id))
        .fetch_optional(pool)
        .await
}

async fn delete_all_for(pool: &SqlitePool, user_id: u64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM reminders WHERE user_id = ?")
        .bind(id(user_id))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

async fn due_reminders(pool: &SqlitePool, now: i64) -> Result<Vec<Reminder>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, user_id, channel_id, message, remind_at, created_at, reply_to_message_id
         FROM reminders WHERE remind_at <= ? ORDER BY remind_at",
    )
    .bind(now)
    .fetch_all(pool)
    .await
}

async fn delete_by_id(pool: &SqlitePool, reminder_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM reminders WHERE id = ?")
        .bind(reminder_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reminder commands - set, list, remove reminders
#[poise::command(
    prefix_command,
    slash_command,
    subcommands("remind_set", "remind_list", "remind_remove", "remind_clear")
)]
pub async fn remind(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set a new reminder
#[poise::command(prefix_command, slash_command, rename = "set")]
pub async fn remind_set(
    ctx: Context<'_>,
    #[description = "Time duration (e.g., 5m, 1h, 2d)"] time: String,
    #[description = "Reminder message (optional when replying to a message)"]
    #[rest]
    message: Option<String>,
) -> Result<(), Error> {
    log::info!(
        "Remind set command called by {} with time: '{}' and message: '{:?}'",
        ctx.author().name,
        time,
        message
    );

    // Only prefix invocations can reference a message
    let reply_to_message_id = match ctx {
        poise::Context::Prefix(prefix_ctx) => prefix_ctx
            .msg
            .referenced_message
            .as_ref()
            .map(|msg| msg.id.get()),
        _ => None,
    };

    let reminder_message = match message.as_deref().map(str::trim) {
        Some(msg) if !msg.is_empty() => msg.to_string(),
        _ if reply_to_message_id.is_some() => "⏰ Reminder".to_string(),
        _ => {
            ctx.say("❌ Please provide a reminder message!").await?;
            return Ok(());
        }
    };

    let Some(duration) = parse_duration(&time) else {
        ctx.say("❌ Invalid time format! Use formats like: 5m, 1h, 2d, 1w")
            .await?;
        return Ok(());
    };

    let now = now_ts();
    let Some(remind_at) = now.checked_add(duration.num_seconds()) else {
        ctx.say("❌ That's too far in the future!").await?;
        return Ok(());
    };

    let reminder_id = insert_reminder(
        &ctx.data().db,
        NewReminder {
            user_id: ctx.author().id.get(),
            channel_id: ctx.channel_id().get(),
            message: &reminder_message,
            remind_at,
            created_at: now,
            reply_to_message_id,
        },
    )
    .await?;

    let embed = CreateEmbed::new()
        .title("⏰ Reminder Set!")
        .description(format!(
            "**Message:** {}\n**Remind at:** <t:{}:F>",
            reminder_message, remind_at
        ))
        .color(Color::DARK_GREEN)
        .footer(CreateEmbedFooter::new(format!("Reminder ID: {reminder_id}")))
        .timestamp(serenity::Timestamp::now());

    ctx.send(poise::CreateReply::default().embed(embed)).await?;

    log::info!(
        "Reminder {} set successfully for user {}",
        reminder_id,
        ctx.author().name
    );
    Ok(())
}

/// List your active reminders
#[poise::command(prefix_command, slash_command, rename = "list")]
pub async fn remind_list(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Remind list command called by {}", ctx.author().name);

    let reminders = pending_for(&ctx.data().db, ctx.author().id.get(), now_ts()).await?;

    if reminders.is_empty() {
        ctx.say("📭 You have no active reminders!").await?;
        return Ok(());
    }

    let mut description = String::new();
    for reminder in reminders.iter().take(LIST_LIMIT) {
        description.push_str(&format!(
            "**ID {}:** {}\n⏰ <t:{}:R>\n\n",
            reminder.id, reminder.message, reminder.remind_at
        ));
    }
    if reminders.len() > LIST_LIMIT {
        description.push_str(&format!("... and {} more", reminders.len() - LIST_LIMIT));
    }

    let embed = CreateEmbed::new()
        .title("📋 Your Active Reminders")
        .description(description)
        .color(Color::BLUE)
        .footer(CreateEmbedFooter::new(format!(
            "Total active reminders: {}",
            reminders.len()
        )))
        .timestamp(serenity::Timestamp::now());

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Remove a specific reminder by ID
#[poise::command(prefix_command, slash_command, rename = "remove")]
pub async fn remind_remove(
    ctx: Context<'_>,
    #[description = "Reminder ID to remove"] id: i64,
) -> Result<(), Error> {
    log::info!(
        "Remind remove command called by {} for ID: {}",
        ctx.author().name,
        id
    );

    match delete_reminder(&ctx.data().db, ctx.author().id.get(), id).await? {
        Some(message) => {
            let embed = CreateEmbed::new()
                .title("🗑️ Reminder Removed")
                .description(format!("**Removed:** {message}"))
                .color(Color::DARK_RED)
                .timestamp(serenity::Timestamp::now());
            ctx.send(poise::CreateReply::default().embed(embed)).await?;
        }
        None => {
            ctx.say("❌ Reminder not found! Make sure you own this reminder and the ID is correct.")
                .await?;
        }
    }
    Ok(())
}

/// Clear all your reminders
#[poise::command(prefix_command, slash_command, rename = "clear")]
pub async fn remind_clear(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Remind clear command called by {}", ctx.author().name);

    let removed = delete_all_for(&ctx.data().db, ctx.author().id.get()).await?;
    if removed == 0 {
        ctx.say("📭 You have no reminders to clear!").await?;
        return Ok(());
    }

    let embed = CreateEmbed::new()
        .title("🧹 Reminders Cleared")
        .description(format!("Removed {removed} reminder(s)"))
        .color(Color::ORANGE)
        .timestamp(serenity::Timestamp::now());

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Start the reminder checker background task
pub fn start_reminder_checker(http: Arc<serenity::Http>, pool: SqlitePool) {
    tokio::spawn(async move {
        let mut interval = interval(TokioDuration::from_secs(CHECK_INTERVAL_SECS));

        loop {
            interval.tick().await;

            if let Err(e) = check_and_send_reminders(&http, &pool).await {
                log::error!("Error checking reminders: {e}");
            }
        }
    });
}

async fn check_and_send_reminders(http: &serenity::Http, pool: &SqlitePool) -> Result<(), Error> {
    let now = now_ts();

    for reminder in due_reminders(pool, now).await? {
        let channel_id = serenity::ChannelId::new(reminder.channel_id as u64);

        let embed = CreateEmbed::new()
            .title("⏰ Reminder!")
            .description(&reminder.message)
            .color(Color::GOLD)
            .footer(CreateEmbedFooter::new(format!(
                "Set {} ago",
                format_duration(Duration::seconds(now - reminder.created_at))
            )))
            .timestamp(serenity::Timestamp::now());

        let mut message_builder = serenity::CreateMessage::new()
            .content(format!("<@{}>", reminder.user_id))
            .embed(embed);

        if let Some(reply_msg_id) = reminder.reply_to_message_id {
            message_builder = message_builder.reference_message((
                channel_id,
                serenity::MessageId::new(reply_msg_id as u64),
            ));
        }

        match channel_id.send_message(http, message_builder).await {
            Ok(_) => log::info!("Sent reminder {} to user {}", reminder.id, reminder.user_id),
            // Deleted below anyway, a gone channel would fail forever
            Err(e) => log::error!("Failed to send reminder {}: {}", reminder.id, e),
        }
        delete_by_id(pool, reminder.id).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn new_reminder(user_id: u64, remind_at: i64) -> NewReminder<'static> {
        NewReminder {
            user_id,
            channel_id: 10,
            message: "drink water",
            remind_at,
            created_at: 0,
            reply_to_message_id: None,
        }
    }

    #[tokio::test]
    async fn test_pending_only_lists_future_reminders_of_owner() {
        let pool = test_pool().await;
        insert_reminder(&pool, new_reminder(1, 500)).await.unwrap();
        insert_reminder(&pool, new_reminder(1, 200)).await.unwrap();
        insert_reminder(&pool, new_reminder(1, 50)).await.unwrap();
        insert_reminder(&pool, new_reminder(2, 500)).await.unwrap();

        let pending = pending_for(&pool, 1, 100).await.unwrap();
        let times: Vec<i64> = pending.iter().map(|r| r.remind_at).collect();
        assert_eq!(times, vec![200, 500]);
    }

    #[tokio::test]
    async fn test_remove_requires_owner() {
        let pool = test_pool().await;
        let reminder_id = insert_reminder(&pool, new_reminder(1, 500)).await.unwrap();

        assert_eq!(delete_reminder(&pool, 2, reminder_id).await.unwrap(), None);
        assert_eq!(
            delete_reminder(&pool, 1, reminder_id).await.unwrap().as_deref(),
            Some("drink water")
        );
        assert_eq!(delete_reminder(&pool, 1, reminder_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_and_due() {
        let pool = test_pool().await;
        insert_reminder(&pool, new_reminder(1, 10)).await.unwrap();
        insert_reminder(&pool, new_reminder(1, 20)).await.unwrap();
        let mut with_reply = new_reminder(2, 15);
        with_reply.reply_to_message_id = Some(99);
        insert_reminder(&pool, with_reply).await.unwrap();

        let due = due_reminders(&pool, 15).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[1].reply_to_message_id, Some(99));

        assert_eq!(delete_all_for(&pool, 1).await.unwrap(), 2);
        assert_eq!(delete_all_for(&pool, 1).await.unwrap(), 0);
    }
}
