use poise::serenity_prelude as serenity;
use serenity::{Client, GatewayIntents};
use sqlx::SqlitePool;

mod commands;
mod config;
mod db;
mod events;
mod utils;

use commands::ai::AiLimiter;
use config::Config;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

// User data, which is stored and accessible in all command invocations
pub struct Data {
    pub db: SqlitePool,
    pub config: Config,
    pub http_client: reqwest::Client,
    pub ai_limiter: AiLimiter,
}

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    // This is our global error handler
    match error {
        poise::FrameworkError::Setup { error, .. } => panic!("Failed to start bot: {:?}", error),
        poise::FrameworkError::Command { error, ctx, .. } => {
            log::error!("Error in command `{}`: {:?}", ctx.command().qualified_name, error);
            if let Err(e) = ctx.say("❌ Something went wrong, please try again later.").await {
                log::error!("Failed to report command error: {}", e);
            }
        }
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                log::error!("Error while handling error: {}", e)
            }
        }
    }
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if config.groq_api_key.is_none() && config.gemini_api_key.is_none() {
        log::warn!("No GROQ_API_KEY or GEMINI_API_KEY configured, AI chat is disabled");
    }
    if config.giphy_api_key.is_none() {
        log::warn!("No GIPHY_API_KEY configured, gif search is disabled");
    }

    let db = match db::connect(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Failed to open database {}: {}", config.database_url, e);
            std::process::exit(1);
        }
    };

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let token = config.discord_token.clone();
    let prefix = config.prefix.clone();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(prefix),
                ..Default::default()
            },
            event_handler: |ctx, event, _framework, data| {
                Box::pin(async move {
                    events::handle_event(ctx, event, data).await;
                    Ok(())
                })
            },
            on_error: |error| Box::pin(on_error(error)),
            pre_command: |ctx| {
                Box::pin(async move {
                    log::info!("Executing command {}...", ctx.command().qualified_name);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    log::info!("Executed command {}!", ctx.command().qualified_name);
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                log::info!("Logged in as {} in {} guilds", ready.user.name, ready.guilds.len());

                match config.guild_id {
                    Some(guild_id) => {
                        poise::builtins::register_in_guild(ctx, &framework.options().commands, guild_id)
                            .await?;
                        log::info!("Slash commands registered to guild {}", guild_id);
                    }
                    None => {
                        poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                        log::info!("Slash commands registered globally");
                    }
                }

                commands::remind::start_reminder_checker(ctx.http.clone(), db.clone());

                Ok(Data {
                    db,
                    config,
                    http_client: reqwest::Client::new(),
                    ai_limiter: commands::ai::new_limiter(),
                })
            })
        })
        .build();

    let mut client = Client::builder(&token, intents)
        .framework(framework)
        .await
        .expect("Error creating client");

    // Graceful shutdown on SIGINT/SIGTERM
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("Shutdown signal received, stopping bot...");
        shard_manager.shutdown_all().await;
    });

    log::info!("Starting bot...");
    if let Err(why) = client.start().await {
        log::error!("Client error: {:?}", why);
    }
    log::info!("Bot has shut down");
}

/// Wait for Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
