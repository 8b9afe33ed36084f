use crate::db::id;
use crate::utils::now_ts;
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use rand::Rng;
use serenity::{Color, CreateEmbed, CreateEmbedFooter, CreateMessage};
use sqlx::SqlitePool;

const PAGE_SIZE: i64 = 10;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LevelSettings {
    pub enabled: bool,
    pub announce_channel_id: Option<i64>,
    pub xp_min: i64,
    pub xp_max: i64,
    pub cooldown_secs: i64,
}

impl Default for LevelSettings {
    fn default() -> Self {
        LevelSettings {
            enabled: true,
            announce_channel_id: None,
            xp_min: 15,
            xp_max: 25,
            cooldown_secs: 60,
        }
    }
}

/// XP needed to go from `level` to `level + 1`.
pub fn xp_for_next(level: i64) -> i64 {
    5 * level * level + 50 * level + 100
}

/// Highest level reachable with `total_xp`.
pub fn level_from_xp(total_xp: i64) -> i64 {
    let mut level = 0;
    let mut remaining = total_xp;
    while remaining >= xp_for_next(level) {
        remaining -= xp_for_next(level);
        level += 1;
    }
    level
}

/// (level, xp into that level, xp needed for the next one)
pub fn progress(total_xp: i64) -> (i64, i64, i64) {
    let level = level_from_xp(total_xp);
    let spent: i64 = (0..level).map(xp_for_next).sum();
    (level, total_xp - spent, xp_for_next(level))
}

fn progress_bar(current: i64, needed: i64) -> String {
    let filled = if needed > 0 {
        ((current * 10) / needed).clamp(0, 10) as usize
    } else {
        0
    };
    format!("{}{}", "🟩".repeat(filled), "⬜".repeat(10 - filled))
}

pub async fn settings(pool: &SqlitePool, guild_id: u64) -> Result<LevelSettings, sqlx::Error> {
    let row: Option<LevelSettings> = sqlx::query_as(
        "SELECT enabled, announce_channel_id, xp_min, xp_max, cooldown_secs FROM leveling_settings WHERE guild_id = ?",
    )
    .bind(id(guild_id))
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or_default())
}

async fn save_settings(
    pool: &SqlitePool,
    guild_id: u64,
    settings: &LevelSettings,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO leveling_settings (guild_id, enabled, announce_channel_id, xp_min, xp_max, cooldown_secs)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(guild_id) DO UPDATE SET
            enabled = excluded.enabled,
            announce_channel_id = excluded.announce_channel_id,
            xp_min = excluded.xp_min,
            xp_max = excluded.xp_max,
            cooldown_secs = excluded.cooldown_secs",
    )
    .bind(id(guild_id))
    .bind(settings.enabled)
    .bind(settings.announce_channel_id)
    .bind(settings.xp_min)
    .bind(settings.xp_max)
    .bind(settings.cooldown_secs)
    .execute(pool)
    .await?;
    Ok(())
}

/// Total XP of a member, 0 when unseen.
pub async fn total_xp(pool: &SqlitePool, guild_id: u64, user_id: u64) -> Result<i64, sqlx::Error> {
    let xp: Option<i64> = sqlx::query_scalar("SELECT xp FROM levels WHERE guild_id = ? AND user_id = ?")
        .bind(id(guild_id))
        .bind(id(user_id))
        .fetch_optional(pool)
        .await?;
    Ok(xp.unwrap_or(0))
}

pub struct XpGain {
    pub total: i64,
    /// Set when this gain crossed into a new level.
    pub new_level: Option<i64>,
}

/// Grant `amount` XP unless the member is still on cooldown. Returns `None`
/// when nothing was granted.
pub async fn award_xp(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    amount: i64,
    cooldown_secs: i64,
    now: i64,
) -> Result<Option<XpGain>, sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO levels (guild_id, user_id, xp, level, last_xp_at) VALUES (?, ?, 0, 0, 0)")
        .bind(id(guild_id))
        .bind(id(user_id))
        .execute(pool)
        .await?;

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE levels SET xp = xp + ?, last_xp_at = ? WHERE guild_id = ? AND user_id = ? AND last_xp_at <= ?",
    )
    .bind(amount)
    .bind(now)
    .bind(id(guild_id))
    .bind(id(user_id))
    .bind(now - cooldown_secs)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    let (total, stored_level): (i64, i64) =
        sqlx::query_as("SELECT xp, level FROM levels WHERE guild_id = ? AND user_id = ?")
            .bind(id(guild_id))
            .bind(id(user_id))
            .fetch_one(&mut *tx)
            .await?;

    let level = level_from_xp(total);
    let new_level = if level > stored_level {
        sqlx::query("UPDATE levels SET level = ? WHERE guild_id = ? AND user_id = ?")
            .bind(level)
            .bind(id(guild_id))
            .bind(id(user_id))
            .execute(&mut *tx)
            .await?;
        Some(level)
    } else {
        None
    };
    tx.commit().await?;

    Ok(Some(XpGain { total, new_level }))
}

pub async fn set_xp(pool: &SqlitePool, guild_id: u64, user_id: u64, xp: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO levels (guild_id, user_id, xp, level, last_xp_at) VALUES (?, ?, ?, ?, 0)
         ON CONFLICT(guild_id, user_id) DO UPDATE SET xp = excluded.xp, level = excluded.level",
    )
    .bind(id(guild_id))
    .bind(id(user_id))
    .bind(xp)
    .bind(level_from_xp(xp))
    .execute(pool)
    .await?;
    Ok(())
}

/// 1-based position on the guild board, `None` when the member has no XP row.
pub async fn rank_position(pool: &SqlitePool, guild_id: u64, user_id: u64) -> Result<Option<i64>, sqlx::Error> {
    let xp: Option<i64> = sqlx::query_scalar("SELECT xp FROM levels WHERE guild_id = ? AND user_id = ?")
        .bind(id(guild_id))
        .bind(id(user_id))
        .fetch_optional(pool)
        .await?;
    let Some(xp) = xp else {
        return Ok(None);
    };
    let ahead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM levels WHERE guild_id = ? AND xp > ?")
        .bind(id(guild_id))
        .bind(xp)
        .fetch_one(pool)
        .await?;
    Ok(Some(ahead + 1))
}

/// Rows skipped before `page` (1-based); huge pages saturate instead of overflowing.
fn page_offset(page: i64) -> i64 {
    page.saturating_sub(1).max(0).saturating_mul(PAGE_SIZE)
}

pub async fn leaderboard_page(pool: &SqlitePool, guild_id: u64, page: i64) -> Result<Vec<(i64, i64)>, sqlx::Error> {
    sqlx::query_as("SELECT user_id, xp FROM levels WHERE guild_id = ? ORDER BY xp DESC, user_id LIMIT ? OFFSET ?")
        .bind(id(guild_id))
        .bind(PAGE_SIZE)
        .bind(page_offset(page))
        .fetch_all(pool)
        .await
}

pub async fn set_reward(pool: &SqlitePool, guild_id: u64, level: i64, role_id: Option<u64>) -> Result<(), sqlx::Error> {
    match role_id {
        Some(role_id) => {
            sqlx::query("INSERT OR REPLACE INTO level_rewards (guild_id, level, role_id) VALUES (?, ?, ?)")
                .bind(id(guild_id))
                .bind(level)
                .bind(id(role_id))
                .execute(pool)
                .await?;
        }
        None => {
            sqlx::query("DELETE FROM level_rewards WHERE guild_id = ? AND level = ?")
                .bind(id(guild_id))
                .bind(level)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Reward roles for every level up to and including `level`.
pub async fn rewards_up_to(pool: &SqlitePool, guild_id: u64, level: i64) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT role_id FROM level_rewards WHERE guild_id = ? AND level <= ? ORDER BY level")
        .bind(id(guild_id))
        .bind(level)
        .fetch_all(pool)
        .await
}

/// Hand out message XP and announce level-ups.
pub async fn on_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    let pool = &data.db;
    let settings = settings(pool, guild_id.get()).await?;
    if !settings.enabled {
        return Ok(());
    }

    let amount = rand::thread_rng().gen_range(settings.xp_min..=settings.xp_max.max(settings.xp_min));
    let Some(gain) = award_xp(
        pool,
        guild_id.get(),
        msg.author.id.get(),
        amount,
        settings.cooldown_secs,
        now_ts(),
    )
    .await?
    else {
        return Ok(());
    };
    let Some(level) = gain.new_level else {
        return Ok(());
    };

    log::info!(
        "{} reached level {} in guild {} ({} xp)",
        msg.author.name,
        level,
        guild_id,
        gain.total
    );

    let announce_channel = settings
        .announce_channel_id
        .map(|c| serenity::ChannelId::new(c as u64))
        .unwrap_or(msg.channel_id);
    let embed = CreateEmbed::new()
        .title("⬆️ Level up!")
        .description(format!("<@{}> reached **level {level}**!", msg.author.id))
        .color(Color::MAGENTA);
    if let Err(e) = announce_channel
        .send_message(&ctx.http, CreateMessage::new().embed(embed))
        .await
    {
        log::warn!("Failed to announce level up in {}: {}", announce_channel, e);
    }

    let roles = rewards_up_to(pool, guild_id.get(), level).await?;
    if roles.is_empty() {
        return Ok(());
    }
    let member = guild_id.member(&ctx.http, msg.author.id).await?;
    for role in roles {
        let role_id = serenity::RoleId::new(role as u64);
        if member.roles.contains(&role_id) {
            continue;
        }
        if let Err(e) = member.add_role(&ctx.http, role_id).await {
            log::warn!("Failed to grant reward role {} to {}: {}", role_id, msg.author.name, e);
        }
    }
    Ok(())
}

/// Show a member's level card
#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn rank(
    ctx: Context<'_>,
    #[description = "Member (default: you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    log::info!("Rank command called by {}", ctx.author().name);

    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let target = user.as_ref().unwrap_or_else(|| ctx.author());
    let pool = &ctx.data().db;

    let xp = total_xp(pool, guild_id.get(), target.id.get()).await?;
    let (level, into, needed) = progress(xp);
    let position = rank_position(pool, guild_id.get(), target.id.get())
        .await?
        .map(|p| format!("#{p}"))
        .unwrap_or_else(|| "unranked".to_string());

    let embed = CreateEmbed::new()
        .title(format!("📊 {}", target.name))
        .thumbnail(target.face())
        .field("Level", level.to_string(), true)
        .field("Rank", position, true)
        .field("Total XP", xp.to_string(), true)
        .field(
            format!("Progress {into}/{needed}"),
            progress_bar(into, needed),
            false,
        )
        .color(Color::MAGENTA);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Leveling leaderboard and settings
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    subcommands(
        "levels_leaderboard",
        "levels_enable",
        "levels_disable",
        "levels_channel",
        "levels_xp",
        "levels_reward",
        "levels_setxp"
    )
)]
pub async fn levels(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Top members by XP
#[poise::command(prefix_command, slash_command, guild_only, rename = "leaderboard")]
pub async fn levels_leaderboard(
    ctx: Context<'_>,
    #[description = "Page (default: 1)"] page: Option<i64>,
) -> Result<(), Error> {
    log::info!("Levels leaderboard called by {}", ctx.author().name);

    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let page = page.unwrap_or(1).max(1);
    let rows = leaderboard_page(&ctx.data().db, guild_id.get(), page).await?;
    if rows.is_empty() {
        ctx.say("📭 Nobody on this page yet!").await?;
        return Ok(());
    }

    let offset = page_offset(page);
    let mut description = String::new();
    for (i, (user_id, xp)) in rows.iter().enumerate() {
        description.push_str(&format!(
            "**{}.** <@{}> — level {} ({} xp)\n",
            offset.saturating_add(i as i64 + 1),
            user_id,
            level_from_xp(*xp),
            xp
        ));
    }

    let embed = CreateEmbed::new()
        .title("🏆 Level leaderboard")
        .description(description)
        .color(Color::MAGENTA)
        .footer(CreateEmbedFooter::new(format!("Page {page}")));
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Turn message XP on
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "enable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn levels_enable(ctx: Context<'_>) -> Result<(), Error> {
    toggle(ctx, true).await
}

/// Turn message XP off
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "disable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn levels_disable(ctx: Context<'_>) -> Result<(), Error> {
    toggle(ctx, false).await
}

async fn toggle(ctx: Context<'_>, enabled: bool) -> Result<(), Error> {
    log::info!("Leveling set to {} by {}", enabled, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let pool = &ctx.data().db;
    let mut current = settings(pool, guild_id.get()).await?;
    current.enabled = enabled;
    save_settings(pool, guild_id.get(), &current).await?;
    ctx.say(if enabled {
        "✅ Leveling enabled."
    } else {
        "🔕 Leveling disabled."
    })
    .await?;
    Ok(())
}

/// Where level-up announcements go (empty: the channel of the message)
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "channel",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn levels_channel(
    ctx: Context<'_>,
    #[description = "Announcement channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    log::info!("Levels channel set by {}", ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let pool = &ctx.data().db;
    let mut current = settings(pool, guild_id.get()).await?;
    current.announce_channel_id = channel.as_ref().map(|c| id(c.id.get()));
    save_settings(pool, guild_id.get(), &current).await?;

    match channel {
        Some(c) => ctx.say(format!("✅ Level-ups will be announced in <#{}>.", c.id)).await?,
        None => ctx.say("✅ Level-ups will be announced where they happen.").await?,
    };
    Ok(())
}

/// XP per message and cooldown
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "xp",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn levels_xp(
    ctx: Context<'_>,
    #[description = "Minimum XP per message"] min: i64,
    #[description = "Maximum XP per message"] max: i64,
    #[description = "Seconds between XP grants"] cooldown: Option<i64>,
) -> Result<(), Error> {
    log::info!("Levels xp set by {}: {}-{}", ctx.author().name, min, max);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if min <= 0 || min > max {
        ctx.say("❌ Use a positive minimum that is not above the maximum!").await?;
        return Ok(());
    }

    let pool = &ctx.data().db;
    let mut current = settings(pool, guild_id.get()).await?;
    current.xp_min = min;
    current.xp_max = max;
    if let Some(cooldown) = cooldown {
        current.cooldown_secs = cooldown.max(0);
    }
    save_settings(pool, guild_id.get(), &current).await?;

    ctx.say(format!(
        "✅ Messages now give **{min}-{max}** XP every **{}s**.",
        current.cooldown_secs
    ))
    .await?;
    Ok(())
}

/// Grant a role when members reach a level (no role removes the reward)
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "reward",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn levels_reward(
    ctx: Context<'_>,
    #[description = "Level"] level: i64,
    #[description = "Role to grant"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    log::info!("Levels reward for {} set by {}", level, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if level <= 0 {
        ctx.say("❌ Level must be positive!").await?;
        return Ok(());
    }

    set_reward(&ctx.data().db, guild_id.get(), level, role.as_ref().map(|r| r.id.get())).await?;
    match role {
        Some(r) => ctx.say(format!("✅ Level **{level}** now grants **{}**.", r.name)).await?,
        None => ctx.say(format!("🗑️ Level **{level}** reward removed.")).await?,
    };
    Ok(())
}

/// Overwrite a member's total XP
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "setxp",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn levels_setxp(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
    #[description = "Total XP"] xp: i64,
) -> Result<(), Error> {
    log::info!("Setxp for {} by {}: {}", user.name, ctx.author().name, xp);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let xp = xp.max(0);
    set_xp(&ctx.data().db, guild_id.get(), user.id.get(), xp).await?;
    ctx.say(format!(
        "✅ **{}** now has **{xp}** XP (level {}).",
        user.name,
        level_from_xp(xp)
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn test_level_curve() {
        assert_eq!(xp_for_next(0), 100);
        assert_eq!(xp_for_next(1), 155);
        assert_eq!(xp_for_next(2), 220);

        assert_eq!(level_from_xp(0), 0);
        assert_eq!(level_from_xp(99), 0);
        assert_eq!(level_from_xp(100), 1);
        assert_eq!(level_from_xp(254), 1);
        assert_eq!(level_from_xp(255), 2);
        assert_eq!(level_from_xp(475), 3);
    }

    #[test]
    fn test_progress() {
        assert_eq!(progress(0), (0, 0, 100));
        assert_eq!(progress(130), (1, 30, 155));
        assert_eq!(progress_bar(0, 100), "⬜".repeat(10));
        assert_eq!(progress_bar(50, 100), format!("{}{}", "🟩".repeat(5), "⬜".repeat(5)));
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(page_offset(1), 0);
        assert_eq!(page_offset(3), 20);
        assert_eq!(page_offset(0), 0);
        assert_eq!(page_offset(i64::MIN), 0);
        assert_eq!(page_offset(i64::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn test_award_respects_cooldown_and_levels_up() {
        let pool = test_pool().await;

        let first = award_xp(&pool, 1, 2, 60, 60, 1_000).await.unwrap().unwrap();
        assert_eq!(first.total, 60);
        assert_eq!(first.new_level, None);

        assert!(award_xp(&pool, 1, 2, 60, 60, 1_030).await.unwrap().is_none());

        let second = award_xp(&pool, 1, 2, 60, 60, 1_060).await.unwrap().unwrap();
        assert_eq!(second.total, 120);
        assert_eq!(second.new_level, Some(1));

        let third = award_xp(&pool, 1, 2, 10, 60, 1_200).await.unwrap().unwrap();
        assert_eq!(third.new_level, None);
    }

    #[tokio::test]
    async fn test_settings_default_and_roundtrip() {
        let pool = test_pool().await;
        assert_eq!(settings(&pool, 9).await.unwrap(), LevelSettings::default());

        let custom = LevelSettings {
            enabled: false,
            announce_channel_id: Some(123),
            xp_min: 5,
            xp_max: 10,
            cooldown_secs: 30,
        };
        save_settings(&pool, 9, &custom).await.unwrap();
        assert_eq!(settings(&pool, 9).await.unwrap(), custom);
    }

    #[tokio::test]
    async fn test_rank_and_rewards() {
        let pool = test_pool().await;
        set_xp(&pool, 1, 10, 500).await.unwrap();
        set_xp(&pool, 1, 11, 900).await.unwrap();
        set_xp(&pool, 1, 12, 100).await.unwrap();
        set_xp(&pool, 2, 13, 5000).await.unwrap();

        assert_eq!(rank_position(&pool, 1, 11).await.unwrap(), Some(1));
        assert_eq!(rank_position(&pool, 1, 12).await.unwrap(), Some(3));
        assert_eq!(rank_position(&pool, 1, 99).await.unwrap(), None);

        let page = leaderboard_page(&pool, 1, 1).await.unwrap();
        assert_eq!(page, vec![(11, 900), (10, 500), (12, 100)]);
        assert!(leaderboard_page(&pool, 1, 2).await.unwrap().is_empty());
        assert!(leaderboard_page(&pool, 1, i64::MAX).await.unwrap().is_empty());
        assert_eq!(leaderboard_page(&pool, 1, i64::MIN).await.unwrap().len(), 3);

        set_reward(&pool, 1, 5, Some(555)).await.unwrap();
        set_reward(&pool, 1, 10, Some(1010)).await.unwrap();
        assert_eq!(rewards_up_to(&pool, 1, 7).await.unwrap(), vec![555]);
        set_reward(&pool, 1, 5, None).await.unwrap();
        assert!(rewards_up_to(&pool, 1, 7).await.unwrap().is_empty());
    }
}
