use poise::serenity_prelude as serenity;
use std::env;

use crate::Error;

/// Runtime configuration, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub database_url: String,
    pub prefix: String,
    pub guild_id: Option<serenity::GuildId>,
    pub groq_api_key: Option<String>,
    pub groq_model: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub giphy_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| "Expected a Discord bot token in the environment variable DISCORD_TOKEN")?;

        let guild_id = match optional_var("GUILD_ID") {
            Some(raw) => {
                let id: u64 = raw
                    .parse()
                    .map_err(|_| format!("Invalid GUILD_ID: '{raw}'"))?;
                Some(serenity::GuildId::new(id))
            }
            None => None,
        };

        Ok(Self {
            discord_token,
            database_url: optional_var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:guildkeeper.db".to_string()),
            prefix: optional_var("BOT_PREFIX").unwrap_or_else(|| "-".to_string()),
            guild_id,
            groq_api_key: optional_var("GROQ_API_KEY"),
            groq_model: optional_var("GROQ_MODEL")
                .unwrap_or_else(|| "llama-3.1-8b-instant".to_string()),
            gemini_api_key: optional_var("GEMINI_API_KEY"),
            gemini_model: optional_var("GEMINI_MODEL")
                .unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            giphy_api_key: optional_var("GIPHY_API_KEY"),
        })
    }
}

/// Treats unset and blank variables the same way.
fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
