use crate::db::id;
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use serenity::{
    ButtonStyle, Color, CreateActionRow, CreateButton, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage,
};
use sqlx::SqlitePool;

pub const VERIFY_BUTTON_ID: &str = "verify";

#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct VerificationSettings {
    pub role_id: i64,
    pub channel_id: i64,
}

pub async fn verification_settings(
    pool: &SqlitePool,
    guild_id: u64,
) -> Result<Option<VerificationSettings>, sqlx::Error> {
    sqlx::query_as("SELECT role_id, channel_id FROM verification_settings WHERE guild_id = ?")
        .bind(id(guild_id))
        .fetch_optional(pool)
        .await
}

async fn save_settings(pool: &SqlitePool, guild_id: u64, settings: VerificationSettings) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR REPLACE INTO verification_settings (guild_id, role_id, channel_id) VALUES (?, ?, ?)")
        .bind(id(guild_id))
        .bind(settings.role_id)
        .bind(settings.channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn delete_settings(pool: &SqlitePool, guild_id: u64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM verification_settings WHERE guild_id = ?")
        .bind(id(guild_id))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Member verification
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("verification_setup", "verification_disable")
)]
pub async fn verification(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Post a verify button that grants a role
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "setup",
    required_permissions = "MANAGE_GUILD",
    required_bot_permissions = "MANAGE_ROLES"
)]
pub async fn verification_setup(
    ctx: Context<'_>,
    #[description = "Role granted on verification"] role: serenity::Role,
    #[description = "Where to post the panel (default: here)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    log::info!("Verification setup by {} with role {}", ctx.author().name, role.name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let channel_id = channel.map(|c| c.id).unwrap_or_else(|| ctx.channel_id());

    save_settings(
        &ctx.data().db,
        guild_id.get(),
        VerificationSettings {
            role_id: id(role.id.get()),
            channel_id: id(channel_id.get()),
        },
    )
    .await?;

    let panel = CreateMessage::new()
        .embed(
            CreateEmbed::new()
                .title("✅ Verification")
                .description("Press the button below to verify yourself and unlock the server.")
                .color(Color::DARK_GREEN),
        )
        .components(vec![CreateActionRow::Buttons(vec![CreateButton::new(VERIFY_BUTTON_ID)
            .label("Verify")
            .emoji('✅')
            .style(ButtonStyle::Success)])]);
    channel_id.send_message(ctx.http(), panel).await?;

    ctx.send(
        poise::CreateReply::default()
            .content(format!("✅ Verification panel posted in <#{channel_id}> granting **{}**.", role.name))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Turn verification off
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "disable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn verification_disable(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Verification disabled by {}", ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    if delete_settings(&ctx.data().db, guild_id.get()).await? {
        ctx.say("🔕 Verification disabled. Old panels will stop working.").await?;
    } else {
        ctx.say("❌ Verification wasn't set up.").await?;
    }
    Ok(())
}

pub async fn handle_verify_button(
    ctx: &serenity::Context,
    interaction: &serenity::ComponentInteraction,
    data: &Data,
) -> Result<(), Error> {
    let (Some(guild_id), Some(member)) = (interaction.guild_id, interaction.member.as_ref()) else {
        return Ok(());
    };

    let reply = match verification_settings(&data.db, guild_id.get()).await? {
        None => "❌ Verification isn't configured on this server.".to_string(),
        Some(settings) => {
            let role_id = serenity::RoleId::new(settings.role_id as u64);
            if member.roles.contains(&role_id) {
                "✅ You're already verified!".to_string()
            } else {
                match member.add_role(&ctx.http, role_id).await {
                    Ok(()) => {
                        log::info!("Verified {} in guild {}", member.user.name, guild_id);
                        "🎉 You're verified, welcome!".to_string()
                    }
                    Err(e) => {
                        log::warn!("Failed to verify {} in guild {}: {}", member.user.name, guild_id, e);
                        "❌ I couldn't give you the role. Please contact a moderator.".to_string()
                    }
                }
            }
        }
    };

    interaction
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(reply)
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_settings_lifecycle() {
        let pool = test_pool().await;
        assert_eq!(verification_settings(&pool, 3).await.unwrap(), None);
        assert!(!delete_settings(&pool, 3).await.unwrap());

        let settings = VerificationSettings {
            role_id: 11,
            channel_id: 22,
        };
        save_settings(&pool, 3, settings).await.unwrap();
        assert_eq!(verification_settings(&pool, 3).await.unwrap(), Some(settings));

        assert!(delete_settings(&pool, 3).await.unwrap());
        assert_eq!(verification_settings(&pool, 3).await.unwrap(), None);
    }
}
