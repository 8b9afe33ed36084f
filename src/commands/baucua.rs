use crate::commands::economy::{self, CURRENCY};
use crate::utils::author_has_permission;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use rand::Rng;
use serenity::{Color, CreateEmbed, CreateEmbedFooter, CreateMessage};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

// One betting round per channel
lazy_static::lazy_static! {
    static ref ROUNDS: RwLock<HashMap<u64, Round>> = RwLock::new(HashMap::new());
}

const DEFAULT_WINDOW_SECS: u64 = 30;
const MIN_WINDOW_SECS: u64 = 10;
const MAX_WINDOW_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, poise::ChoiceParameter)]
pub enum Symbol {
    #[name = "Bầu"]
    Bau,
    #[name = "Cua"]
    Cua,
    #[name = "Tôm"]
    Tom,
    #[name = "Cá"]
    Ca,
    #[name = "Gà"]
    Ga,
    #[name = "Nai"]
    Nai,
}

impl Symbol {
    const ALL: [Symbol; 6] = [
        Symbol::Bau,
        Symbol::Cua,
        Symbol::Tom,
        Symbol::Ca,
        Symbol::Ga,
        Symbol::Nai,
    ];

    fn emoji(self) -> &'static str {
        match self {
            Symbol::Bau => "🍐",
            Symbol::Cua => "🦀",
            Symbol::Tom => "🦐",
            Symbol::Ca => "🐟",
            Symbol::Ga => "🐓",
            Symbol::Nai => "🦌",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Symbol::Bau => "Bầu",
            Symbol::Cua => "Cua",
            Symbol::Tom => "Tôm",
            Symbol::Ca => "Cá",
            Symbol::Ga => "Gà",
            Symbol::Nai => "Nai",
        }
    }

    fn roll() -> Symbol {
        Symbol::ALL[rand::thread_rng().gen_range(0..Symbol::ALL.len())]
    }
}

struct Round {
    id: u64,
    starter_id: u64,
    // user -> symbol -> total stake
    bets: HashMap<u64, HashMap<Symbol, i64>>,
}

impl Round {
    fn new(id: u64, starter_id: u64) -> Self {
        Round {
            id,
            starter_id,
            bets: HashMap::new(),
        }
    }

    fn place(&mut self, user_id: u64, symbol: Symbol, amount: i64) -> i64 {
        let stake = self
            .bets
            .entry(user_id)
            .or_default()
            .entry(symbol)
            .or_insert(0);
        *stake += amount;
        *stake
    }

    fn total_staked(&self, user_id: u64) -> i64 {
        self.bets
            .get(&user_id)
            .map(|b| b.values().sum())
            .unwrap_or(0)
    }
}

/// What a player gets back for one bet: nothing if the symbol is absent,
/// otherwise the stake plus the stake once per matching die.
fn payout(stake: i64, symbol: Symbol, dice: &[Symbol; 3]) -> i64 {
    let hits = dice.iter().filter(|d| **d == symbol).count() as i64;
    if hits == 0 {
        0
    } else {
        stake.saturating_mul(hits + 1)
    }
}

/// Per-player (returned, staked) totals for a roll.
fn settle(bets: &HashMap<u64, HashMap<Symbol, i64>>, dice: &[Symbol; 3]) -> Vec<(u64, i64, i64)> {
    let mut results: Vec<(u64, i64, i64)> = bets
        .iter()
        .map(|(user_id, user_bets)| {
            let staked: i64 = user_bets.values().sum();
            let returned: i64 = user_bets
                .iter()
                .map(|(symbol, stake)| payout(*stake, *symbol, dice))
                .sum();
            (*user_id, returned, staked)
        })
        .collect();
    results.sort_by_key(|(_, returned, staked)| std::cmp::Reverse(returned - staked));
    results
}

fn next_round_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Bầu Cua Tôm Cá betting game
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    subcommands("baucua_start", "baucua_bet", "baucua_cancel")
)]
pub async fn baucua(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Open a betting round in this channel
#[poise::command(prefix_command, slash_command, guild_only, rename = "start")]
pub async fn baucua_start(
    ctx: Context<'_>,
    #[description = "Betting window in seconds (10-120, default 30)"] seconds: Option<u64>,
) -> Result<(), Error> {
    log::info!("Baucua start called by {}", ctx.author().name);

    let window = seconds
        .unwrap_or(DEFAULT_WINDOW_SECS)
        .clamp(MIN_WINDOW_SECS, MAX_WINDOW_SECS);
    let channel_id = ctx.channel_id().get();
    let round_id = next_round_id();

    let opened = {
        let mut rounds = ROUNDS.write().await;
        if rounds.contains_key(&channel_id) {
            false
        } else {
            rounds.insert(channel_id, Round::new(round_id, ctx.author().id.get()));
            true
        }
    };
    if !opened {
        ctx.say("❌ A round is already running in this channel!").await?;
        return Ok(());
    }

    let board = Symbol::ALL
        .iter()
        .map(|s| format!("{} {}", s.emoji(), s.label()))
        .collect::<Vec<_>>()
        .join("  ");

    let embed = CreateEmbed::new()
        .title("🎲 Bầu Cua Tôm Cá")
        .description(format!(
            "{board}\n\nPlace your bets with `/baucua bet <symbol> <amount>`!\nThe bowl opens <t:{}:R>.",
            chrono::Utc::now().timestamp() + window as i64
        ))
        .color(Color::ORANGE)
        .footer(CreateEmbedFooter::new(format!(
            "Started by {}",
            ctx.author().name
        )));
    // The timer owns the round from here on, even if the announcement fails
    let http = ctx.serenity_context().http.clone();
    let pool = ctx.data().db.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(window)).await;
        if let Err(e) = resolve_round(http, pool, channel_id, round_id).await {
            log::error!("Failed to resolve baucua round {}: {}", round_id, e);
        }
    });

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Credit every winning player for `dice` and return one result line per player.
async fn pay_out(pool: &SqlitePool, bets: &HashMap<u64, HashMap<Symbol, i64>>, dice: &[Symbol; 3]) -> Vec<String> {
    let mut lines = Vec::new();
    for (user_id, returned, staked) in settle(bets, dice) {
        if returned > 0 {
            if let Err(e) = economy::credit(pool, user_id, returned).await {
                log::error!("Failed to pay {} to user {}: {}", returned, user_id, e);
                lines.push(format!("⚠️ <@{user_id}> payout failed, contact an admin"));
                continue;
            }
        }
        let net = returned.saturating_sub(staked);
        let marker = if net > 0 { "📈" } else if net < 0 { "📉" } else { "➖" };
        lines.push(format!("{marker} <@{user_id}> {net:+} {CURRENCY}"));
    }
    lines
}

/// Give every player back what they staked. Returns how many were refunded.
async fn refund(pool: &SqlitePool, bets: &HashMap<u64, HashMap<Symbol, i64>>) -> usize {
    let mut refunded = 0;
    for (user_id, user_bets) in bets {
        let stake: i64 = user_bets.values().sum();
        match economy::credit(pool, *user_id, stake).await {
            Ok(_) => refunded += 1,
            Err(e) => log::error!("Failed to refund {} to user {}: {}", stake, user_id, e),
        }
    }
    refunded
}

async fn resolve_round(
    http: Arc<serenity::Http>,
    pool: SqlitePool,
    channel_id: u64,
    round_id: u64,
) -> Result<(), Error> {
    let round = {
        let mut rounds = ROUNDS.write().await;
        // Cancelled, or replaced by a newer round
        let current = rounds.get(&channel_id).map(|r| r.id) == Some(round_id);
        if current {
            rounds.remove(&channel_id)
        } else {
            None
        }
    };
    let Some(round) = round else {
        return Ok(());
    };

    let dice = [Symbol::roll(), Symbol::roll(), Symbol::roll()];
    let roll_text = dice
        .iter()
        .map(|d| format!("{} **{}**", d.emoji(), d.label()))
        .collect::<Vec<_>>()
        .join(" | ");

    let lines = pay_out(&pool, &round.bets, &dice).await;
    let results = if lines.is_empty() {
        "Nobody placed a bet this round.".to_string()
    } else {
        lines.join("\n")
    };

    let embed = CreateEmbed::new()
        .title("🎲 The bowl is open!")
        .description(format!("{roll_text}\n\n{results}"))
        .color(Color::DARK_GREEN);

    serenity::ChannelId::new(channel_id)
        .send_message(&http, CreateMessage::new().embed(embed))
        .await?;

    log::info!(
        "Baucua round {} resolved in channel {} with {} players",
        round_id,
        channel_id,
        round.bets.len()
    );
    Ok(())
}

/// Bet on a symbol in the running round
#[poise::command(prefix_command, slash_command, guild_only, rename = "bet")]
pub async fn baucua_bet(
    ctx: Context<'_>,
    #[description = "Symbol to bet on"] symbol: Symbol,
    #[description = "Stake"] amount: i64,
) -> Result<(), Error> {
    log::info!(
        "Baucua bet by {}: {} on {}",
        ctx.author().name,
        amount,
        symbol.label()
    );

    if amount <= 0 {
        ctx.say("❌ Stake must be positive!").await?;
        return Ok(());
    }

    let channel_id = ctx.channel_id().get();
    let user_id = ctx.author().id.get();

    // Hold the lock across the debit so the round cannot resolve in between
    let mut rounds = ROUNDS.write().await;
    let Some(round) = rounds.get_mut(&channel_id) else {
        drop(rounds);
        ctx.say("❌ No round is open here. Start one with `/baucua start`.")
            .await?;
        return Ok(());
    };

    if !economy::try_debit(&ctx.data().db, user_id, amount).await? {
        drop(rounds);
        ctx.say("❌ You don't have enough coins for that bet!").await?;
        return Ok(());
    }

    let on_symbol = round.place(user_id, symbol, amount);
    let total = round.total_staked(user_id);
    drop(rounds);

    ctx.say(format!(
        "✅ **{}** bet **{amount}** {CURRENCY} on {} {} (on this symbol: {on_symbol}, total: {total})",
        ctx.author().name,
        symbol.emoji(),
        symbol.label()
    ))
    .await?;
    Ok(())
}

/// Cancel the running round and refund every bet
#[poise::command(prefix_command, slash_command, guild_only, rename = "cancel")]
pub async fn baucua_cancel(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Baucua cancel called by {}", ctx.author().name);

    let channel_id = ctx.channel_id().get();
    let can_manage =
        author_has_permission(ctx, serenity::Permissions::MANAGE_MESSAGES).await;
    let author_id = ctx.author().id.get();

    let round = {
        let mut rounds = ROUNDS.write().await;
        let allowed = rounds
            .get(&channel_id)
            .map(|r| r.starter_id == author_id || can_manage);
        match allowed {
            Some(true) => rounds.remove(&channel_id),
            Some(false) => {
                drop(rounds);
                ctx.say("❌ Only the round starter or a moderator can cancel it!")
                    .await?;
                return Ok(());
            }
            None => None,
        }
    };

    let Some(round) = round else {
        ctx.say("❌ No round is open here.").await?;
        return Ok(());
    };

    let refunded = refund(&ctx.data().db, &round.bets).await;

    ctx.say(format!("🛑 Round cancelled, {refunded} player(s) refunded."))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payout() {
        let dice = [Symbol::Cua, Symbol::Cua, Symbol::Ga];
        assert_eq!(payout(100, Symbol::Nai, &dice), 0);
        assert_eq!(payout(100, Symbol::Ga, &dice), 200);
        assert_eq!(payout(100, Symbol::Cua, &dice), 300);
        assert_eq!(payout(100, Symbol::Tom, &[Symbol::Tom; 3]), 400);
    }

    #[test]
    fn test_bets_accumulate() {
        let mut round = Round::new(1, 10);
        assert_eq!(round.place(1, Symbol::Ca, 50), 50);
        assert_eq!(round.place(1, Symbol::Ca, 25), 75);
        round.place(1, Symbol::Bau, 10);
        assert_eq!(round.total_staked(1), 85);
        assert_eq!(round.total_staked(2), 0);
    }

    #[test]
    fn test_settle_orders_by_net() {
        let mut round = Round::new(1, 10);
        round.place(1, Symbol::Nai, 100);
        round.place(2, Symbol::Cua, 100);
        round.place(3, Symbol::Cua, 50);
        round.place(3, Symbol::Ga, 50);

        let dice = [Symbol::Cua, Symbol::Tom, Symbol::Ca];
        let results = settle(&round.bets, &dice);
        assert_eq!(results, vec![(2, 200, 100), (3, 100, 100), (1, 0, 100)]);
    }

    #[tokio::test]
    async fn test_pay_out_credits_winners() {
        let pool = crate::db::test_pool().await;
        let mut round = Round::new(1, 10);
        round.place(1, Symbol::Cua, 100);
        round.place(2, Symbol::Nai, 50);
        round.place(3, Symbol::Ga, 20);
        round.place(3, Symbol::Tom, 20);

        let dice = [Symbol::Cua, Symbol::Cua, Symbol::Ga];
        let lines = pay_out(&pool, &round.bets, &dice).await;

        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("<@1> +200"));
        assert!(lines[2].contains("<@2> -50"));
        assert_eq!(economy::balance_of(&pool, 1).await.unwrap(), 300);
        assert_eq!(economy::balance_of(&pool, 2).await.unwrap(), 0);
        assert_eq!(economy::balance_of(&pool, 3).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_refund_returns_every_stake() {
        let pool = crate::db::test_pool().await;
        let mut round = Round::new(1, 10);
        round.place(1, Symbol::Cua, 100);
        round.place(1, Symbol::Ca, 25);
        round.place(2, Symbol::Bau, 40);

        assert_eq!(refund(&pool, &round.bets).await, 2);
        assert_eq!(economy::balance_of(&pool, 1).await.unwrap(), 125);
        assert_eq!(economy::balance_of(&pool, 2).await.unwrap(), 40);
        assert_eq!(refund(&pool, &HashMap::new()).await, 0);
    }

    #[tokio::test]
    async fn test_stale_timer_does_not_resolve_newer_round() {
        let channel_id = 9_000_001;
        ROUNDS
            .write()
            .await
            .insert(channel_id, Round::new(42, 1));

        let pool = crate::db::test_pool().await;
        let http = Arc::new(serenity::Http::new(""));
        resolve_round(http, pool, channel_id, 41).await.unwrap();

        assert!(ROUNDS.read().await.contains_key(&channel_id));
        ROUNDS.write().await.remove(&channel_id);
    }
}
