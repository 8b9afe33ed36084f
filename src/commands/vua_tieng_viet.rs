use crate::commands::economy::{self, CURRENCY};
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use rand::seq::SliceRandom;
use serenity::{Color, CreateEmbed, CreateEmbedFooter, CreateMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

// Active word games, keyed by channel
lazy_static::lazy_static! {
    static ref GAMES: RwLock<HashMap<u64, WordGame>> = RwLock::new(HashMap::new());
}

const TIME_LIMIT_SECS: u64 = 60;
const REWARD: i64 = 200;

const PHRASES: &[&str] = &[
    "học sinh",
    "giáo viên",
    "bánh mì",
    "cà phê",
    "áo dài",
    "phở bò",
    "hoa sen",
    "quê hương",
    "mùa xuân",
    "trăng rằm",
    "sông hồng",
    "núi rừng",
    "biển xanh",
    "bạn bè",
    "gia đình",
    "trường học",
    "máy tính",
    "điện thoại",
    "thư viện",
    "bóng đá",
    "con mèo",
    "con chó",
    "hạnh phúc",
    "tình yêu",
    "cầu vồng",
    "mặt trời",
    "ngôi sao",
    "bánh chưng",
    "tết nguyên đán",
    "chợ nổi",
    "ruộng lúa",
    "xe đạp",
    "lồng đèn",
    "nước mắm",
    "bún chả",
    "đồng hồ",
    "cây tre",
    "hà nội",
    "sài gòn",
    "vịnh hạ long",
];

struct WordGame {
    id: u64,
    answer: String,
    scrambled: String,
}

/// Lower-case and collapse runs of whitespace.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_correct(guess: &str, answer: &str) -> bool {
    let guess = normalize(guess);
    let answer = normalize(answer);
    guess == answer || guess.replace(' ', "") == answer.replace(' ', "")
}

/// Shuffle the letters of `phrase` (spaces dropped) into a ` / `-separated
/// puzzle. Retries so the puzzle never spells the answer when another
/// arrangement exists.
fn scramble(phrase: &str) -> String {
    let letters: Vec<char> = phrase.chars().filter(|c| !c.is_whitespace()).collect();
    let mut shuffled = letters.clone();
    let mut rng = rand::thread_rng();

    let all_same = letters.windows(2).all(|w| w[0] == w[1]);
    if !all_same {
        while shuffled == letters {
            shuffled.shuffle(&mut rng);
        }
    }

    shuffled
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" / ")
}

fn next_game_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Vua Tiếng Việt: unscramble the Vietnamese phrase
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    subcommands("vtv_start", "vtv_skip")
)]
pub async fn vtv(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Start a new puzzle in this channel
#[poise::command(prefix_command, slash_command, guild_only, rename = "start")]
pub async fn vtv_start(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Vua Tieng Viet started by {}", ctx.author().name);

    let channel_id = ctx.channel_id().get();
    let answer = PHRASES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("tiếng việt")
        .to_string();
    let game_id = next_game_id();
    let scrambled = scramble(&answer);
    let word_count = answer.split_whitespace().count();

    let started = {
        let mut games = GAMES.write().await;
        if games.contains_key(&channel_id) {
            false
        } else {
            games.insert(
                channel_id,
                WordGame {
                    id: game_id,
                    answer: answer.clone(),
                    scrambled: scrambled.clone(),
                },
            );
            true
        }
    };
    if !started {
        ctx.say("❌ A puzzle is already running here! Solve it or use `/vtv skip`.")
            .await?;
        return Ok(());
    }

    let embed = CreateEmbed::new()
        .title("👑 Vua Tiếng Việt")
        .description(format!(
            "Unscramble this phrase:\n\n**{scrambled}**\n\n📝 {word_count} word(s) • first correct answer wins **{REWARD}** {CURRENCY}"
        ))
        .color(Color::RED)
        .footer(CreateEmbedFooter::new(format!(
            "{TIME_LIMIT_SECS} seconds on the clock"
        )));
    // Armed before announcing so a failed send still frees the channel
    let http = ctx.serenity_context().http.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(TIME_LIMIT_SECS)).await;
        expire_game(http, channel_id, game_id).await;
    });

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Remove the channel's game only if it is still game `game_id`; a solved or
/// skipped game may have been replaced by a newer one.
async fn take_if_current(channel_id: u64, game_id: u64) -> Option<WordGame> {
    let mut games = GAMES.write().await;
    if games.get(&channel_id).map(|g| g.id) == Some(game_id) {
        games.remove(&channel_id)
    } else {
        None
    }
}

async fn expire_game(http: Arc<serenity::Http>, channel_id: u64, game_id: u64) {
    let Some(game) = take_if_current(channel_id, game_id).await else {
        return;
    };

    if let Err(e) = serenity::ChannelId::new(channel_id)
        .say(&http, format!("⏰ Time's up! The answer was **{}**.", game.answer))
        .await
    {
        log::warn!("Failed to announce expired word game: {}", e);
    }
}

/// Reveal the answer and end the puzzle
#[poise::command(prefix_command, slash_command, guild_only, rename = "skip")]
pub async fn vtv_skip(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Vua Tieng Viet skipped by {}", ctx.author().name);

    let game = GAMES.write().await.remove(&ctx.channel_id().get());
    match game {
        Some(game) => {
            ctx.say(format!(
                "⏭️ Skipped! **{}** was **{}**.",
                game.scrambled, game.answer
            ))
            .await?;
        }
        None => {
            ctx.say("❌ No puzzle is running here.").await?;
        }
    }
    Ok(())
}

/// Check channel messages against the running puzzle.
pub async fn on_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    let channel_id = msg.channel_id.get();

    // Cheap read first, most messages are not in a game channel
    if !GAMES.read().await.contains_key(&channel_id) {
        return Ok(());
    }

    let solved = {
        let mut games = GAMES.write().await;
        let hit = games
            .get(&channel_id)
            .map(|g| is_correct(&msg.content, &g.answer))
            .unwrap_or(false);
        if hit {
            games.remove(&channel_id)
        } else {
            None
        }
    };
    let Some(game) = solved else {
        return Ok(());
    };

    let balance = economy::credit(&data.db, msg.author.id.get(), REWARD).await?;
    log::info!(
        "Word game {} solved by {} in channel {}",
        game.id,
        msg.author.name,
        channel_id
    );

    let embed = CreateEmbed::new()
        .title("🎉 Correct!")
        .description(format!(
            "<@{}> solved **{}** and won **{REWARD}** {CURRENCY}!",
            msg.author.id, game.answer
        ))
        .color(Color::DARK_GREEN)
        .footer(CreateEmbedFooter::new(format!("Balance: {balance}")));

    msg.channel_id
        .send_message(&ctx.http, CreateMessage::new().embed(embed).reference_message(msg))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_matching() {
        assert!(is_correct("bánh mì", "bánh mì"));
        assert!(is_correct("  Bánh   Mì ", "bánh mì"));
        assert!(is_correct("bánhmì", "bánh mì"));
        assert!(!is_correct("banh mi", "bánh mì"));
        assert!(!is_correct("bánh", "bánh mì"));
    }

    #[test]
    fn test_scramble_keeps_letters() {
        for phrase in PHRASES {
            let puzzle = scramble(phrase);
            let mut got: Vec<String> = puzzle.split(" / ").map(str::to_string).collect();
            let mut want: Vec<String> = phrase
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| c.to_string())
                .collect();
            got.sort();
            want.sort();
            assert_eq!(got, want, "letters changed for {phrase}");

            let joined: String = puzzle.split(" / ").collect();
            assert_ne!(joined, phrase.replace(' ', ""), "puzzle spelled the answer");
        }
    }

    #[tokio::test]
    async fn test_stale_timer_keeps_newer_game() {
        let channel_id = 9_100_001;
        let game = |id| WordGame {
            id,
            answer: "cà phê".to_string(),
            scrambled: "ê / c / h / p / à".to_string(),
        };
        GAMES.write().await.insert(channel_id, game(42));

        let http = Arc::new(serenity::Http::new(""));
        expire_game(http, channel_id, 41).await;
        assert!(GAMES.read().await.contains_key(&channel_id));

        let taken = take_if_current(channel_id, 42).await.map(|g| g.id);
        assert_eq!(taken, Some(42));
        assert!(!GAMES.read().await.contains_key(&channel_id));
        assert!(take_if_current(channel_id, 42).await.is_none());
    }

    #[test]
    fn test_scramble_single_repeated_letter() {
        assert_eq!(scramble("aaa"), "a / a / a");
    }
}
