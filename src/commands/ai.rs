use crate::config::Config;
use crate::db::id;
use crate::{Context, Data, Error};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use poise::serenity_prelude as serenity;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

// Conversation history per channel
lazy_static::lazy_static! {
    static ref HISTORY: RwLock<HashMap<u64, VecDeque<Turn>>> = RwLock::new(HashMap::new());
}

const GROQ_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const SYSTEM_PROMPT: &str = "You are a friendly assistant living in a Discord server. \
Answer concisely, use Discord markdown, and reply in the language the user writes in.";
const MAX_HISTORY_TURNS: usize = 20;
const MAX_TOKENS: u32 = 1024;
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

pub type AiLimiter = DefaultKeyedRateLimiter<u64>;

/// Five requests per user per minute.
pub fn new_limiter() -> AiLimiter {
    RateLimiter::keyed(Quota::per_minute(nonzero!(5u32)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
struct Turn {
    role: Role,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

fn openai_messages<'a>(history: &'a [Turn]) -> Vec<ChatMessage<'a>> {
    let mut messages = vec![ChatMessage {
        role: "system",
        content: SYSTEM_PROMPT,
    }];
    messages.extend(history.iter().map(|turn| ChatMessage {
        role: match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        },
        content: &turn.content,
    }));
    messages
}

fn gemini_body(history: &[Turn]) -> serde_json::Value {
    let contents: Vec<serde_json::Value> = history
        .iter()
        .map(|turn| {
            json!({
                "role": match turn.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                },
                "parts": [{ "text": turn.content }],
            })
        })
        .collect();

    json!({
        "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
        "contents": contents,
        "generationConfig": { "maxOutputTokens": MAX_TOKENS },
    })
}

async fn ask_groq(client: &reqwest::Client, api_key: &str, model: &str, history: &[Turn]) -> Result<String, Error> {
    let response = client
        .post(GROQ_URL)
        .bearer_auth(api_key)
        .json(&json!({
            "model": model,
            "messages": openai_messages(history),
            "max_tokens": MAX_TOKENS,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("Groq returned {status}: {body}").into());
    }

    let parsed: ChatCompletionResponse = response.json().await?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| "Groq returned an empty answer".into())
}

async fn ask_gemini(client: &reqwest::Client, api_key: &str, model: &str, history: &[Turn]) -> Result<String, Error> {
    let url = format!("{GEMINI_URL}/{model}:generateContent");
    let response = client
        .post(url)
        .query(&[("key", api_key)])
        .json(&gemini_body(history))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("Gemini returned {status}: {body}").into());
    }

    let parsed: GeminiResponse = response.json().await?;
    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err("Gemini returned an empty answer".into());
    }
    Ok(text)
}

/// Groq first, Gemini when Groq is missing or failing.
async fn ask_providers(client: &reqwest::Client, config: &Config, history: &[Turn]) -> Result<String, Error> {
    let mut last_error: Option<Error> = None;

    if let Some(key) = &config.groq_api_key {
        match ask_groq(client, key, &config.groq_model, history).await {
            Ok(answer) => return Ok(answer),
            Err(e) => {
                log::warn!("Groq request failed, trying Gemini: {}", e);
                last_error = Some(e);
            }
        }
    }

    if let Some(key) = &config.gemini_api_key {
        return ask_gemini(client, key, &config.gemini_model, history).await;
    }

    Err(last_error.unwrap_or_else(|| "No AI provider is configured".into()))
}

fn push_turn(history: &mut VecDeque<Turn>, role: Role, content: String) {
    history.push_back(Turn { role, content });
    while history.len() > MAX_HISTORY_TURNS {
        history.pop_front();
    }
}

/// Ask the model with the channel's history as context and remember the exchange.
async fn chat(data: &Data, channel_id: u64, user_name: &str, prompt: &str) -> Result<String, Error> {
    let mut history: Vec<Turn> = HISTORY
        .read()
        .await
        .get(&channel_id)
        .map(|h| h.iter().cloned().collect())
        .unwrap_or_default();
    let question = format!("{user_name}: {prompt}");
    history.push(Turn {
        role: Role::User,
        content: question.clone(),
    });

    let answer = ask_providers(&data.http_client, &data.config, &history).await?;

    let mut all = HISTORY.write().await;
    let channel_history = all.entry(channel_id).or_default();
    push_turn(channel_history, Role::User, question);
    push_turn(channel_history, Role::Assistant, answer.clone());
    Ok(answer)
}

/// Split text into Discord-sized chunks, preferring line breaks.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    // Discord rejects blank messages
    fn flush(chunks: &mut Vec<String>, chunk: String) {
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > limit && !current.is_empty() {
            flush(&mut chunks, std::mem::take(&mut current));
        }
        if line.chars().count() > limit {
            // A single line that is too long gets hard-wrapped
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                let piece: String = piece.iter().collect();
                if piece.chars().count() == limit {
                    flush(&mut chunks, piece);
                } else {
                    current = piece;
                }
            }
        } else {
            current.push_str(line);
        }
    }
    flush(&mut chunks, current);
    chunks
}

pub async fn ai_channel(pool: &SqlitePool, guild_id: u64) -> Result<Option<u64>, sqlx::Error> {
    let channel: Option<i64> = sqlx::query_scalar("SELECT channel_id FROM ai_settings WHERE guild_id = ?")
        .bind(id(guild_id))
        .fetch_optional(pool)
        .await?;
    Ok(channel.map(|c| c as u64))
}

async fn set_ai_channel(pool: &SqlitePool, guild_id: u64, channel_id: Option<u64>) -> Result<(), sqlx::Error> {
    match channel_id {
        Some(channel_id) => {
            sqlx::query("INSERT OR REPLACE INTO ai_settings (guild_id, channel_id) VALUES (?, ?)")
                .bind(id(guild_id))
                .bind(id(channel_id))
                .execute(pool)
                .await?;
        }
        None => {
            sqlx::query("DELETE FROM ai_settings WHERE guild_id = ?")
                .bind(id(guild_id))
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Chat with the AI assistant
#[poise::command(
    prefix_command,
    slash_command,
    subcommands("ai_ask", "ai_reset", "ai_channel_cmd")
)]
pub async fn ai(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Ask the assistant something
#[poise::command(prefix_command, slash_command, rename = "ask")]
pub async fn ai_ask(
    ctx: Context<'_>,
    #[description = "Your question"]
    #[rest]
    prompt: String,
) -> Result<(), Error> {
    log::info!("AI ask called by {}", ctx.author().name);

    if prompt.trim().is_empty() {
        ctx.say("❌ Ask me something!").await?;
        return Ok(());
    }
    if ctx.data().ai_limiter.check_key(&ctx.author().id.get()).is_err() {
        ctx.say("⏳ Slow down! You can ask 5 questions per minute.").await?;
        return Ok(());
    }

    ctx.defer().await?;
    match chat(ctx.data(), ctx.channel_id().get(), &ctx.author().name, &prompt).await {
        Ok(answer) => {
            for chunk in split_message(&answer, DISCORD_MESSAGE_LIMIT) {
                ctx.say(chunk).await?;
            }
        }
        Err(e) => {
            log::error!("AI request from {} failed: {}", ctx.author().name, e);
            ctx.say("❌ The AI is unavailable right now, try again later.").await?;
        }
    }
    Ok(())
}

/// Forget this channel's conversation
#[poise::command(prefix_command, slash_command, rename = "reset")]
pub async fn ai_reset(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("AI history reset by {}", ctx.author().name);
    HISTORY.write().await.remove(&ctx.channel_id().get());
    ctx.say("🧹 Conversation cleared.").await?;
    Ok(())
}

/// Channel where every message gets an AI reply (empty: turn off)
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "channel",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn ai_channel_cmd(
    ctx: Context<'_>,
    #[description = "Auto-reply channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    log::info!("AI channel set by {}", ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    set_ai_channel(&ctx.data().db, guild_id.get(), channel.as_ref().map(|c| c.id.get())).await?;
    match channel {
        Some(c) => ctx.say(format!("🤖 I'll answer every message in <#{}>.", c.id)).await?,
        None => ctx.say("🔕 AI auto-replies turned off.").await?,
    };
    Ok(())
}

/// Answer messages posted in the guild's AI channel.
pub async fn on_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    if msg.content.trim().is_empty() || msg.content.starts_with(&data.config.prefix) {
        return Ok(());
    }
    if ai_channel(&data.db, guild_id.get()).await? != Some(msg.channel_id.get()) {
        return Ok(());
    }
    if data.ai_limiter.check_key(&msg.author.id.get()).is_err() {
        msg.react(&ctx.http, '⏳').await?;
        return Ok(());
    }

    if let Err(e) = msg.channel_id.broadcast_typing(&ctx.http).await {
        log::debug!("Failed to show typing in {}: {}", msg.channel_id, e);
    }
    let answer = match chat(data, msg.channel_id.get(), &msg.author.name, &msg.content).await {
        Ok(answer) => answer,
        Err(e) => {
            log::error!("AI auto-reply failed in {}: {}", msg.channel_id, e);
            "❌ The AI is unavailable right now, try again later.".to_string()
        }
    };

    let mut chunks = split_message(&answer, DISCORD_MESSAGE_LIMIT).into_iter();
    if let Some(first) = chunks.next() {
        msg.reply(&ctx.http, first).await?;
    }
    for chunk in chunks {
        msg.channel_id.say(&ctx.http, chunk).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn test_split_short_message() {
        assert_eq!(split_message("hello", 2000), vec!["hello".to_string()]);
        assert!(split_message("", 2000).is_empty());
    }

    #[test]
    fn test_split_on_lines() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(
            split_message(text, 10),
            vec!["aaaa\nbbbb\n".to_string(), "cccc".to_string()]
        );
    }

    #[test]
    fn test_split_skips_blank_chunks() {
        let text = format!("{}\n{}\n{}", "a".repeat(9), "\n".repeat(12), "b".repeat(9));
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));

        let spaced = format!("hi{}", " ".repeat(30));
        assert_eq!(split_message(&spaced, 10), vec!["hi        ".to_string()]);
    }

    #[test]
    fn test_split_long_line() {
        let text = "x".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = VecDeque::new();
        for i in 0..(MAX_HISTORY_TURNS + 5) {
            push_turn(&mut history, Role::User, i.to_string());
        }
        assert_eq!(history.len(), MAX_HISTORY_TURNS);
        assert_eq!(history.front().unwrap().content, "5");
    }

    #[test]
    fn test_request_bodies() {
        let history = vec![
            Turn {
                role: Role::User,
                content: "hi".into(),
            },
            Turn {
                role: Role::Assistant,
                content: "hello!".into(),
            },
        ];

        let messages = openai_messages(&history);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[2].role, "assistant");

        let body = gemini_body(&history);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn test_parse_provider_responses() {
        let groq: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"pong"}}]}"#,
        )
        .unwrap();
        assert_eq!(groq.choices[0].message.content.as_deref(), Some("pong"));

        let gemini: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"xin "},{"text":"chào"}]}}]}"#,
        )
        .unwrap();
        let parts = &gemini.candidates[0].content.as_ref().unwrap().parts;
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_rate_limit() {
        let limiter = new_limiter();
        for _ in 0..5 {
            assert!(limiter.check_key(&1).is_ok());
        }
        assert!(limiter.check_key(&1).is_err());
        assert!(limiter.check_key(&2).is_ok());
    }

    #[tokio::test]
    async fn test_ai_channel_setting() {
        let pool = test_pool().await;
        assert_eq!(ai_channel(&pool, 1).await.unwrap(), None);
        set_ai_channel(&pool, 1, Some(77)).await.unwrap();
        assert_eq!(ai_channel(&pool, 1).await.unwrap(), Some(77));
        set_ai_channel(&pool, 1, None).await.unwrap();
        assert_eq!(ai_channel(&pool, 1).await.unwrap(), None);
    }
}
