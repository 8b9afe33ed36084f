use crate::db::id;
use crate::utils::{format_duration, now_ts};
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use rand::Rng;
use serenity::{Color, CreateEmbed, CreateEmbedFooter};
use sqlx::SqlitePool;
use tokio::time::{sleep, Duration};

pub const DAILY_REWARD: i64 = 500;
const DAILY_COOLDOWN_SECS: i64 = 24 * 60 * 60;
pub const CURRENCY: &str = "🪙";

async fn ensure_wallet(pool: &SqlitePool, user_id: u64) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO economy (user_id, balance, last_daily) VALUES (?, 0, 0)")
        .bind(id(user_id))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn balance_of(pool: &SqlitePool, user_id: u64) -> Result<i64, sqlx::Error> {
    let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM economy WHERE user_id = ?")
        .bind(id(user_id))
        .fetch_optional(pool)
        .await?;
    Ok(balance.unwrap_or(0))
}

/// Add `amount` (may be negative) and return the new balance. Never goes below
/// zero or past `i64::MAX`.
pub async fn credit(pool: &SqlitePool, user_id: u64, amount: i64) -> Result<i64, sqlx::Error> {
    ensure_wallet(pool, user_id).await?;
    // SQLite turns an overflowing sum into a REAL, MIN brings it back
    sqlx::query("UPDATE economy SET balance = MIN(MAX(balance + ?, 0), ?) WHERE user_id = ?")
        .bind(amount)
        .bind(i64::MAX)
        .bind(id(user_id))
        .execute(pool)
        .await?;
    balance_of(pool, user_id).await
}

/// Take `amount` from the wallet in a single statement. Returns `false` when
/// the balance is too low, in which case nothing changes.
pub async fn try_debit(pool: &SqlitePool, user_id: u64, amount: i64) -> Result<bool, sqlx::Error> {
    if amount <= 0 {
        return Ok(false);
    }
    let result =
        sqlx::query("UPDATE economy SET balance = balance - ? WHERE user_id = ? AND balance >= ?")
            .bind(amount)
            .bind(id(user_id))
            .bind(amount)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

/// Settle a coin flip in one statement: the stake is won or lost only if the
/// wallet covers it. Returns the new balance, or `None` when nothing changed.
async fn settle_flip(pool: &SqlitePool, user_id: u64, amount: i64, won: bool) -> Result<Option<i64>, sqlx::Error> {
    if amount <= 0 {
        return Ok(None);
    }
    let change = if won { amount } else { -amount };
    let result = sqlx::query(
        "UPDATE economy SET balance = balance + ? WHERE user_id = ? AND balance >= ? AND balance <= ?",
    )
    .bind(change)
    .bind(id(user_id))
    .bind(amount)
    .bind(i64::MAX - change.max(0))
    .execute(pool)
    .await?;
    if result.rows_affected() != 1 {
        return Ok(None);
    }
    Ok(Some(balance_of(pool, user_id).await?))
}

pub async fn transfer(pool: &SqlitePool, from: u64, to: u64, amount: i64) -> Result<bool, sqlx::Error> {
    if amount <= 0 {
        return Ok(false);
    }
    ensure_wallet(pool, to).await?;

    let mut tx = pool.begin().await?;
    let debited =
        sqlx::query("UPDATE economy SET balance = balance - ? WHERE user_id = ? AND balance >= ?")
            .bind(amount)
            .bind(id(from))
            .bind(amount)
            .execute(&mut *tx)
            .await?;
    if debited.rows_affected() != 1 {
        tx.rollback().await?;
        return Ok(false);
    }
    let credited = sqlx::query("UPDATE economy SET balance = balance + ? WHERE user_id = ? AND balance <= ?")
        .bind(amount)
        .bind(id(to))
        .bind(i64::MAX - amount)
        .execute(&mut *tx)
        .await?;
    if credited.rows_affected() != 1 {
        tx.rollback().await?;
        return Ok(false);
    }
    tx.commit().await?;
    Ok(true)
}

pub enum DailyClaim {
    Claimed { balance: i64 },
    TooSoon { remaining_secs: i64 },
}

pub async fn claim_daily(pool: &SqlitePool, user_id: u64, now: i64) -> Result<DailyClaim, sqlx::Error> {
    ensure_wallet(pool, user_id).await?;

    let result = sqlx::query(
        "UPDATE economy SET balance = balance + ?, last_daily = ? WHERE user_id = ? AND last_daily <= ?",
    )
    .bind(DAILY_REWARD)
    .bind(now)
    .bind(id(user_id))
    .bind(now - DAILY_COOLDOWN_SECS)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(DailyClaim::Claimed {
            balance: balance_of(pool, user_id).await?,
        });
    }

    let last: i64 = sqlx::query_scalar("SELECT last_daily FROM economy WHERE user_id = ?")
        .bind(id(user_id))
        .fetch_one(pool)
        .await?;
    Ok(DailyClaim::TooSoon {
        remaining_secs: last + DAILY_COOLDOWN_SECS - now,
    })
}

pub async fn richest(pool: &SqlitePool, limit: i64) -> Result<Vec<(i64, i64)>, sqlx::Error> {
    sqlx::query_as("SELECT user_id, balance FROM economy WHERE balance > 0 ORDER BY balance DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Show your wallet (or someone else's)
#[poise::command(prefix_command, slash_command, aliases("bal"))]
pub async fn balance(
    ctx: Context<'_>,
    #[description = "User to check (default: you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    log::info!("Balance command called by {}", ctx.author().name);

    let target = user.as_ref().unwrap_or_else(|| ctx.author());
    let balance = balance_of(&ctx.data().db, target.id.get()).await?;

    let embed = CreateEmbed::new()
        .title(format!("💰 {}'s wallet", target.name))
        .description(format!("**{balance}** {CURRENCY}"))
        .color(Color::GOLD);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Claim your daily coins
#[poise::command(prefix_command, slash_command)]
pub async fn daily(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Daily command called by {}", ctx.author().name);

    match claim_daily(&ctx.data().db, ctx.author().id.get(), now_ts()).await? {
        DailyClaim::Claimed { balance } => {
            ctx.say(format!(
                "🎁 You claimed **{DAILY_REWARD}** {CURRENCY}! New balance: **{balance}** {CURRENCY}"
            ))
            .await?;
        }
        DailyClaim::TooSoon { remaining_secs } => {
            ctx.say(format!(
                "⏳ You already claimed today. Come back in **{}**.",
                format_duration(chrono::Duration::seconds(remaining_secs))
            ))
            .await?;
        }
    }
    Ok(())
}

/// Give coins to another member
#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn give(
    ctx: Context<'_>,
    #[description = "Who receives the coins"] user: serenity::User,
    #[description = "Amount to give"] amount: i64,
) -> Result<(), Error> {
    log::info!(
        "Give command called by {} -> {} ({})",
        ctx.author().name,
        user.name,
        amount
    );

    if amount <= 0 {
        ctx.say("❌ Amount must be positive!").await?;
        return Ok(());
    }
    if user.bot || user.id == ctx.author().id {
        ctx.say("❌ You can't give coins to that user!").await?;
        return Ok(());
    }

    if !transfer(&ctx.data().db, ctx.author().id.get(), user.id.get(), amount).await? {
        ctx.say("❌ You don't have enough coins!").await?;
        return Ok(());
    }

    ctx.say(format!(
        "💸 **{}** gave **{amount}** {CURRENCY} to **{}**",
        ctx.author().name,
        user.name
    ))
    .await?;
    Ok(())
}

/// Top 10 wallets
#[poise::command(prefix_command, slash_command, rename = "richest")]
pub async fn richest_cmd(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Richest command called by {}", ctx.author().name);

    let rows = richest(&ctx.data().db, 10).await?;
    if rows.is_empty() {
        ctx.say("📭 Nobody has any coins yet!").await?;
        return Ok(());
    }

    let mut description = String::new();
    for (i, (user_id, balance)) in rows.iter().enumerate() {
        description.push_str(&format!("**{}.** <@{}> — {} {CURRENCY}\n", i + 1, user_id, balance));
    }

    let embed = CreateEmbed::new()
        .title("🏆 Richest members")
        .description(description)
        .color(Color::GOLD)
        .timestamp(serenity::Timestamp::now());

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Add (or remove, with a negative amount) coins from a member
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR"
)]
pub async fn addmoney(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
    #[description = "Amount (negative to remove)"] amount: i64,
) -> Result<(), Error> {
    log::info!(
        "Addmoney command called by {} for {} ({})",
        ctx.author().name,
        user.name,
        amount
    );

    let balance = credit(&ctx.data().db, user.id.get(), amount).await?;
    ctx.say(format!("✅ **{}** now has **{balance}** {CURRENCY}", user.name))
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, poise::ChoiceParameter)]
pub enum CoinSide {
    Heads,
    Tails,
}

/// Bet coins on a coin flip
#[poise::command(prefix_command, slash_command)]
pub async fn coinflip(
    ctx: Context<'_>,
    #[description = "Heads or tails"] side: CoinSide,
    #[description = "Stake"] amount: i64,
) -> Result<(), Error> {
    log::info!(
        "Coinflip command called by {} ({:?}, {})",
        ctx.author().name,
        side,
        amount
    );

    if amount <= 0 {
        ctx.say("❌ Stake must be positive!").await?;
        return Ok(());
    }

    let outcome = if rand::thread_rng().gen_bool(0.5) {
        CoinSide::Heads
    } else {
        CoinSide::Tails
    };
    let won = outcome == side;

    // Settled before any message goes out, so a failed send cannot eat the stake
    let Some(balance) = settle_flip(&ctx.data().db, ctx.author().id.get(), amount, won).await? else {
        ctx.say("❌ You don't have enough coins for that bet!").await?;
        return Ok(());
    };

    let initial_message = format!("🪙 **{}** is flipping a coin...", ctx.author().name);
    let reply = ctx.say(initial_message).await?;

    for frame in ["🔄", "🪙", "🔄"] {
        sleep(Duration::from_millis(300)).await;
        let animation_text = format!("{} **{}** is flipping a coin...", frame, ctx.author().name);
        if let Err(e) = reply
            .edit(ctx, poise::CreateReply::default().content(animation_text))
            .await
        {
            log::warn!("Failed to edit animation frame: {}", e);
            break;
        }
    }

    let text = if won {
        format!("🎉 The coin landed on **{}**! You won **{amount}** {CURRENCY}", outcome.label())
    } else {
        format!("😢 The coin landed on **{}**... You lost **{amount}** {CURRENCY}", outcome.label())
    };

    let embed = CreateEmbed::new()
        .title("🪙 Coinflip")
        .description(text)
        .color(if won { Color::DARK_GREEN } else { Color::RED })
        .footer(CreateEmbedFooter::new(format!("Balance: {balance}")));

    if let Err(e) = reply
        .edit(ctx, poise::CreateReply::default().content("").embed(embed))
        .await
    {
        log::warn!("Failed to show coinflip result: {}", e);
    }
    Ok(())
}

impl CoinSide {
    fn label(self) -> &'static str {
        match self {
            CoinSide::Heads => "Heads",
            CoinSide::Tails => "Tails",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_debit_never_overdraws() {
        let pool = test_pool().await;
        credit(&pool, 1, 100).await.unwrap();

        assert!(try_debit(&pool, 1, 60).await.unwrap());
        assert!(!try_debit(&pool, 1, 60).await.unwrap());
        assert_eq!(balance_of(&pool, 1).await.unwrap(), 40);

        assert!(!try_debit(&pool, 1, 0).await.unwrap());
        assert!(!try_debit(&pool, 2, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_credit_floors_at_zero() {
        let pool = test_pool().await;
        assert_eq!(credit(&pool, 7, 50).await.unwrap(), 50);
        assert_eq!(credit(&pool, 7, -80).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_credit_caps_at_max() {
        let pool = test_pool().await;
        credit(&pool, 7, i64::MAX).await.unwrap();
        assert_eq!(credit(&pool, 7, i64::MAX).await.unwrap(), i64::MAX);
        assert_eq!(credit(&pool, 7, -10).await.unwrap(), i64::MAX - 10);
    }

    #[tokio::test]
    async fn test_settle_flip() {
        let pool = test_pool().await;
        credit(&pool, 1, 100).await.unwrap();

        assert_eq!(settle_flip(&pool, 1, 40, true).await.unwrap(), Some(140));
        assert_eq!(settle_flip(&pool, 1, 100, false).await.unwrap(), Some(40));
        assert_eq!(settle_flip(&pool, 1, 41, true).await.unwrap(), None);
        assert_eq!(settle_flip(&pool, 1, 0, true).await.unwrap(), None);
        assert_eq!(settle_flip(&pool, 2, 1, false).await.unwrap(), None);
        assert_eq!(balance_of(&pool, 1).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_settle_flip_huge_win_leaves_wallet_alone() {
        let pool = test_pool().await;
        credit(&pool, 1, i64::MAX).await.unwrap();

        assert_eq!(settle_flip(&pool, 1, i64::MAX, true).await.unwrap(), None);
        assert_eq!(balance_of(&pool, 1).await.unwrap(), i64::MAX);
        assert_eq!(settle_flip(&pool, 1, i64::MAX, false).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_transfer() {
        let pool = test_pool().await;
        credit(&pool, 1, 30).await.unwrap();

        assert!(!transfer(&pool, 1, 2, 31).await.unwrap());
        assert!(transfer(&pool, 1, 2, 30).await.unwrap());
        assert_eq!(balance_of(&pool, 1).await.unwrap(), 0);
        assert_eq!(balance_of(&pool, 2).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_daily_cooldown() {
        let pool = test_pool().await;
        let now = 1_700_000_000;

        match claim_daily(&pool, 5, now).await.unwrap() {
            DailyClaim::Claimed { balance } => assert_eq!(balance, DAILY_REWARD),
            DailyClaim::TooSoon { .. } => panic!("first claim should succeed"),
        }
        match claim_daily(&pool, 5, now + 3600).await.unwrap() {
            DailyClaim::TooSoon { remaining_secs } => assert_eq!(remaining_secs, 23 * 3600),
            DailyClaim::Claimed { .. } => panic!("second claim should be refused"),
        }
        assert!(matches!(
            claim_daily(&pool, 5, now + DAILY_COOLDOWN_SECS).await.unwrap(),
            DailyClaim::Claimed { .. }
        ));
    }

    #[tokio::test]
    async fn test_richest_order() {
        let pool = test_pool().await;
        credit(&pool, 1, 10).await.unwrap();
        credit(&pool, 2, 30).await.unwrap();
        credit(&pool, 3, 20).await.unwrap();

        let rows = richest(&pool, 2).await.unwrap();
        assert_eq!(rows, vec![(2, 30), (3, 20)]);
    }
}
