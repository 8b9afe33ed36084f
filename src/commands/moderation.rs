use crate::commands::logging::send_log;
use crate::db::id;
use crate::utils::{format_duration, now_ts, parse_duration, truncate};
use crate::{Context, Error};
use chrono::Duration;
use poise::serenity_prelude as serenity;
use serenity::{Color, CreateEmbed, CreateEmbedFooter, CreateMessage, EditMember, Mentionable};
use sqlx::SqlitePool;

const MAX_TIMEOUT_DAYS: i64 = 28;
const BULK_DELETE_MAX_AGE_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Warning {
    pub id: i64,
    pub moderator_id: i64,
    pub reason: String,
    pub created_at: i64,
}

pub async fn add_warning(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    moderator_id: u64,
    reason: &str,
    now: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "INSERT INTO warnings (guild_id, user_id, moderator_id, reason, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id(guild_id))
    .bind(id(user_id))
    .bind(id(moderator_id))
    .bind(reason)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query_scalar("SELECT COUNT(*) FROM warnings WHERE guild_id = ? AND user_id = ?")
        .bind(id(guild_id))
        .bind(id(user_id))
        .fetch_one(pool)
        .await
}

pub async fn list_warnings(pool: &SqlitePool, guild_id: u64, user_id: u64) -> Result<Vec<Warning>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, moderator_id, reason, created_at FROM warnings WHERE guild_id = ? AND user_id = ? ORDER BY id",
    )
    .bind(id(guild_id))
    .bind(id(user_id))
    .fetch_all(pool)
    .await
}

pub async fn clear_warnings(pool: &SqlitePool, guild_id: u64, user_id: u64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM warnings WHERE guild_id = ? AND user_id = ?")
        .bind(id(guild_id))
        .bind(id(user_id))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, PartialEq)]
enum TargetProblem {
    SelfTarget,
    Bot,
}

fn target_problem(
    target: serenity::UserId,
    moderator: serenity::UserId,
    bot: serenity::UserId,
) -> Option<TargetProblem> {
    if target == moderator {
        Some(TargetProblem::SelfTarget)
    } else if target == bot {
        Some(TargetProblem::Bot)
    } else {
        None
    }
}

/// Refuse actions aimed at the moderator themself or at the bot.
async fn check_target(ctx: Context<'_>, target: serenity::UserId) -> Result<bool, Error> {
    match target_problem(target, ctx.author().id, ctx.framework().bot_id) {
        Some(TargetProblem::SelfTarget) => {
            ctx.say("❌ You can't use this on yourself!").await?;
            Ok(false)
        }
        Some(TargetProblem::Bot) => {
            ctx.say("❌ Nice try.").await?;
            Ok(false)
        }
        None => Ok(true),
    }
}

async fn report(ctx: Context<'_>, action: &str, target: &serenity::User, reason: &str, color: Color) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let embed = CreateEmbed::new()
        .title(format!("🔨 {action}"))
        .color(color)
        .field("Member", format!("{} ({})", target.mention(), target.name), true)
        .field("Moderator", ctx.author().mention().to_string(), true)
        .field("Reason", reason, false);

    send_log(&ctx.serenity_context().http, &ctx.data().db, guild_id, embed).await
}

fn reason_or_default(reason: Option<String>) -> String {
    reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .map(|r| truncate(&r, 500))
        .unwrap_or_else(|| "No reason given".to_string())
}

/// Kick a member
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "KICK_MEMBERS",
    required_bot_permissions = "KICK_MEMBERS"
)]
pub async fn kick(
    ctx: Context<'_>,
    #[description = "Member to kick"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    log::info!("Kick of {} requested by {}", user.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if !check_target(ctx, user.id).await? {
        return Ok(());
    }

    let reason = reason_or_default(reason);
    guild_id
        .kick_with_reason(ctx.http(), user.id, &reason)
        .await?;

    ctx.say(format!("👢 Kicked **{}**: {reason}", user.name)).await?;
    report(ctx, "Kick", &user, &reason, Color::ORANGE).await
}

/// Ban a member
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "BAN_MEMBERS",
    required_bot_permissions = "BAN_MEMBERS"
)]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "Member to ban"] user: serenity::User,
    #[description = "Days of messages to delete (0-7)"] days: Option<u8>,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    log::info!("Ban of {} requested by {}", user.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if !check_target(ctx, user.id).await? {
        return Ok(());
    }

    let reason = reason_or_default(reason);
    let days = days.unwrap_or(0).min(7);
    guild_id
        .ban_with_reason(ctx.http(), user.id, days, &reason)
        .await?;

    ctx.say(format!("🔨 Banned **{}**: {reason}", user.name)).await?;
    report(ctx, "Ban", &user, &reason, Color::DARK_RED).await
}

/// Lift a ban
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "BAN_MEMBERS",
    required_bot_permissions = "BAN_MEMBERS"
)]
pub async fn unban(
    ctx: Context<'_>,
    #[description = "ID of the banned user"] user_id: serenity::UserId,
) -> Result<(), Error> {
    log::info!("Unban of {} requested by {}", user_id, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if !check_target(ctx, user_id).await? {
        return Ok(());
    }

    if let Err(e) = guild_id.unban(ctx.http(), user_id).await {
        log::warn!("Unban of {} failed: {}", user_id, e);
        ctx.say("❌ That user isn't banned (or I couldn't unban them).")
            .await?;
        return Ok(());
    }

    let user = user_id.to_user(ctx.http()).await?;
    ctx.say(format!("✅ Unbanned **{}**.", user.name)).await?;
    report(ctx, "Unban", &user, "—", Color::DARK_GREEN).await
}

/// Time a member out
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS",
    required_bot_permissions = "MODERATE_MEMBERS"
)]
pub async fn timeout(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
    #[description = "Duration (e.g. 10m, 2h, 1d; max 28d)"] duration: String,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    log::info!(
        "Timeout of {} for {} requested by {}",
        user.name,
        duration,
        ctx.author().name
    );
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if !check_target(ctx, user.id).await? {
        return Ok(());
    }

    let Some(length) = parse_duration(&duration) else {
        ctx.say("❌ Invalid duration! Use formats like: 10m, 2h, 1d").await?;
        return Ok(());
    };
    if length > Duration::days(MAX_TIMEOUT_DAYS) {
        ctx.say("❌ Timeouts can last at most 28 days!").await?;
        return Ok(());
    }

    let Some(until) = now_ts().checked_add(length.num_seconds()) else {
        ctx.say("❌ Timeouts can last at most 28 days!").await?;
        return Ok(());
    };
    let until = serenity::Timestamp::from_unix_timestamp(until)?;
    let reason = reason_or_default(reason);
    guild_id
        .edit_member(
            ctx.http(),
            user.id,
            EditMember::new()
                .disable_communication_until_datetime(until)
                .audit_log_reason(&reason),
        )
        .await?;

    ctx.say(format!(
        "🔇 **{}** timed out for **{}**: {reason}",
        user.name,
        format_duration(length)
    ))
    .await?;
    report(
        ctx,
        &format!("Timeout ({})", format_duration(length)),
        &user,
        &reason,
        Color::ORANGE,
    )
    .await
}

/// Remove a member's timeout
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS",
    required_bot_permissions = "MODERATE_MEMBERS"
)]
pub async fn untimeout(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
) -> Result<(), Error> {
    log::info!("Untimeout of {} requested by {}", user.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if !check_target(ctx, user.id).await? {
        return Ok(());
    }

    guild_id
        .edit_member(ctx.http(), user.id, EditMember::new().enable_communication())
        .await?;

    ctx.say(format!("🔊 **{}** can talk again.", user.name)).await?;
    report(ctx, "Timeout removed", &user, "—", Color::DARK_GREEN).await
}

/// Warn a member
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn warn(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: String,
) -> Result<(), Error> {
    log::info!("Warning for {} issued by {}", user.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if !check_target(ctx, user.id).await? {
        return Ok(());
    }
    if user.bot {
        ctx.say("❌ Bots can't be warned!").await?;
        return Ok(());
    }

    let reason = reason_or_default(Some(reason));
    let count = add_warning(
        &ctx.data().db,
        guild_id.get(),
        user.id.get(),
        ctx.author().id.get(),
        &reason,
        now_ts(),
    )
    .await?;

    let guild_name = ctx
        .guild()
        .map(|g| g.name.clone())
        .unwrap_or_else(|| "the server".to_string());
    let dm = CreateMessage::new().embed(
        CreateEmbed::new()
            .title(format!("⚠️ You were warned in {guild_name}"))
            .description(&reason)
            .color(Color::ORANGE),
    );
    if let Err(e) = user.direct_message(ctx.http(), dm).await {
        log::info!("Could not DM warning to {}: {}", user.name, e);
    }

    ctx.say(format!(
        "⚠️ **{}** has been warned ({count} warning(s) total): {reason}",
        user.name
    ))
    .await?;
    report(ctx, &format!("Warning #{count}"), &user, &reason, Color::GOLD).await
}

/// List a member's warnings
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn warnings(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
) -> Result<(), Error> {
    log::info!("Warnings for {} listed by {}", user.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let list = list_warnings(&ctx.data().db, guild_id.get(), user.id.get()).await?;
    if list.is_empty() {
        ctx.say(format!("✨ **{}** has no warnings.", user.name)).await?;
        return Ok(());
    }

    let mut description = String::new();
    for warning in list.iter().rev().take(15) {
        description.push_str(&format!(
            "**#{}** <t:{}:d> by <@{}>: {}\n",
            warning.id, warning.created_at, warning.moderator_id, warning.reason
        ));
    }

    let embed = CreateEmbed::new()
        .title(format!("⚠️ Warnings for {}", user.name))
        .description(description)
        .color(Color::GOLD)
        .footer(CreateEmbedFooter::new(format!("Total: {}", list.len())));
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Remove all of a member's warnings
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn clearwarnings(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
) -> Result<(), Error> {
    log::info!("Warnings for {} cleared by {}", user.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let removed = clear_warnings(&ctx.data().db, guild_id.get(), user.id.get()).await?;
    ctx.say(format!("🧹 Removed **{removed}** warning(s) from **{}**.", user.name))
        .await?;
    if removed > 0 {
        report(ctx, "Warnings cleared", &user, &format!("{removed} removed"), Color::DARK_GREEN).await?;
    }
    Ok(())
}

/// Which of `messages` can be bulk deleted: newest first, optionally one author, at most `count`.
fn purge_targets(
    messages: &[serenity::Message],
    author: Option<serenity::UserId>,
    count: usize,
    now: i64,
) -> Vec<serenity::MessageId> {
    let cutoff = now - Duration::days(BULK_DELETE_MAX_AGE_DAYS).num_seconds();
    messages
        .iter()
        .filter(|m| author.map_or(true, |a| m.author.id == a))
        .filter(|m| m.timestamp.unix_timestamp() > cutoff)
        .take(count)
        .map(|m| m.id)
        .collect()
}

/// Bulk-delete recent messages
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_MESSAGES",
    required_bot_permissions = "MANAGE_MESSAGES"
)]
pub async fn purge(
    ctx: Context<'_>,
    #[description = "How many messages (1-100)"] count: u8,
    #[description = "Only delete messages from this member"] user: Option<serenity::User>,
) -> Result<(), Error> {
    log::info!("Purge of {} messages requested by {}", count, ctx.author().name);

    let count = count.clamp(1, 100) as usize;
    let channel_id = ctx.channel_id();

    // Prefix invocations include the command message itself
    let before = match ctx {
        poise::Context::Prefix(prefix_ctx) => Some(prefix_ctx.msg.id),
        poise::Context::Application(_) => None,
    };
    let mut builder = serenity::GetMessages::new().limit(100);
    if let Some(before) = before {
        builder = builder.before(before);
    }
    let messages = channel_id.messages(ctx.http(), builder).await?;

    let targets = purge_targets(&messages, user.as_ref().map(|u| u.id), count, now_ts());
    match targets.len() {
        0 => {
            ctx.say("📭 Nothing to delete (messages older than 14 days can't be bulk deleted).")
                .await?;
            return Ok(());
        }
        1 => channel_id.delete_message(ctx.http(), targets[0]).await?,
        _ => channel_id.delete_messages(ctx.http(), &targets).await?,
    }

    let reply = ctx
        .say(format!("🧹 Deleted **{}** message(s).", targets.len()))
        .await?;
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    if let Err(e) = reply.delete(ctx).await {
        log::debug!("Purge confirmation already gone: {}", e);
    }

    if let Some(guild_id) = ctx.guild_id() {
        let embed = CreateEmbed::new()
            .title("🧹 Purge")
            .color(Color::ORANGE)
            .field("Channel", format!("<#{channel_id}>"), true)
            .field("Moderator", ctx.author().mention().to_string(), true)
            .field("Deleted", targets.len().to_string(), true);
        send_log(&ctx.serenity_context().http, &ctx.data().db, guild_id, embed).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_warnings_lifecycle() {
        let pool = test_pool().await;

        assert_eq!(add_warning(&pool, 1, 2, 3, "spam", 100).await.unwrap(), 1);
        assert_eq!(add_warning(&pool, 1, 2, 3, "caps", 200).await.unwrap(), 2);
        assert_eq!(add_warning(&pool, 9, 2, 3, "other guild", 300).await.unwrap(), 1);

        let list = list_warnings(&pool, 1, 2).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].reason, "spam");
        assert_eq!(list[1].created_at, 200);

        assert_eq!(clear_warnings(&pool, 1, 2).await.unwrap(), 2);
        assert!(list_warnings(&pool, 1, 2).await.unwrap().is_empty());
        assert_eq!(list_warnings(&pool, 9, 2).await.unwrap().len(), 1);
    }

    fn message(id: u64, author: u64, sent_at: i64) -> serenity::Message {
        let mut msg = serenity::Message::default();
        msg.id = serenity::MessageId::new(id);
        msg.author.id = serenity::UserId::new(author);
        msg.timestamp = serenity::Timestamp::from_unix_timestamp(sent_at).unwrap();
        msg
    }

    #[test]
    fn test_purge_targets() {
        let now = 1_700_000_000;
        let day = 86_400;
        let messages = vec![
            message(5, 1, now - 10),
            message(4, 2, now - 20),
            message(3, 1, now - 13 * day),
            message(2, 1, now - 15 * day),
            message(1, 2, now - 20 * day),
        ];
        let ids = |targets: Vec<serenity::MessageId>| targets.iter().map(|m| m.get()).collect::<Vec<_>>();

        assert_eq!(ids(purge_targets(&messages, None, 100, now)), vec![5, 4, 3]);
        assert_eq!(ids(purge_targets(&messages, None, 2, now)), vec![5, 4]);
        assert_eq!(
            ids(purge_targets(&messages, Some(serenity::UserId::new(1)), 100, now)),
            vec![5, 3]
        );
        assert!(purge_targets(&messages, Some(serenity::UserId::new(9)), 100, now).is_empty());
    }

    #[test]
    fn test_target_problem() {
        let moderator = serenity::UserId::new(1);
        let bot = serenity::UserId::new(2);
        assert_eq!(target_problem(moderator, moderator, bot), Some(TargetProblem::SelfTarget));
        assert_eq!(target_problem(bot, moderator, bot), Some(TargetProblem::Bot));
        assert_eq!(target_problem(serenity::UserId::new(3), moderator, bot), None);
    }

    #[test]
    fn test_reason_or_default() {
        assert_eq!(reason_or_default(None), "No reason given");
        assert_eq!(reason_or_default(Some("   ".into())), "No reason given");
        assert_eq!(reason_or_default(Some(" spam ".into())), "spam");
    }
}
