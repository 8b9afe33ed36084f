use crate::commands::logging::send_log;
use crate::db::id;
use crate::utils::{author_has_permission, member_has_permission, now_ts};
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use serenity::{
    ButtonStyle, ChannelType, Color, CreateActionRow, CreateButton, CreateChannel, CreateEmbed,
    CreateInteractionResponse, CreateInteractionResponseMessage, CreateMessage, PermissionOverwrite,
    PermissionOverwriteType, Permissions,
};
use sqlx::SqlitePool;

pub const OPEN_BUTTON_ID: &str = "ticket:open";
pub const CLOSE_BUTTON_ID: &str = "ticket:close";

#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct TicketSettings {
    pub category_id: i64,
    pub staff_role_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct OpenTicket {
    pub channel_id: i64,
    pub guild_id: i64,
    pub user_id: i64,
    pub opened_at: i64,
}

pub async fn ticket_settings(pool: &SqlitePool, guild_id: u64) -> Result<Option<TicketSettings>, sqlx::Error> {
    sqlx::query_as("SELECT category_id, staff_role_id FROM ticket_settings WHERE guild_id = ?")
        .bind(id(guild_id))
        .fetch_optional(pool)
        .await
}

async fn save_ticket_settings(pool: &SqlitePool, guild_id: u64, settings: TicketSettings) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR REPLACE INTO ticket_settings (guild_id, category_id, staff_role_id) VALUES (?, ?, ?)")
        .bind(id(guild_id))
        .bind(settings.category_id)
        .bind(settings.staff_role_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn open_ticket_for(pool: &SqlitePool, guild_id: u64, user_id: u64) -> Result<Option<OpenTicket>, sqlx::Error> {
    sqlx::query_as("SELECT channel_id, guild_id, user_id, opened_at FROM open_tickets WHERE guild_id = ? AND user_id = ?")
        .bind(id(guild_id))
        .bind(id(user_id))
        .fetch_optional(pool)
        .await
}

pub async fn ticket_in_channel(pool: &SqlitePool, channel_id: u64) -> Result<Option<OpenTicket>, sqlx::Error> {
    sqlx::query_as("SELECT channel_id, guild_id, user_id, opened_at FROM open_tickets WHERE channel_id = ?")
        .bind(id(channel_id))
        .fetch_optional(pool)
        .await
}

async fn record_ticket(pool: &SqlitePool, ticket: OpenTicket) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO open_tickets (channel_id, guild_id, user_id, opened_at) VALUES (?, ?, ?, ?)")
        .bind(ticket.channel_id)
        .bind(ticket.guild_id)
        .bind(ticket.user_id)
        .bind(ticket.opened_at)
        .execute(pool)
        .await?;
    Ok(())
}

async fn remove_ticket(pool: &SqlitePool, channel_id: u64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM open_tickets WHERE channel_id = ?")
        .bind(id(channel_id))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Channel names only allow lowercase letters, digits, dashes and underscores.
fn ticket_channel_name(username: &str) -> String {
    let cleaned: String = username
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(80)
        .collect();
    if cleaned.is_empty() {
        "ticket".to_string()
    } else {
        format!("ticket-{cleaned}")
    }
}

fn visible_to(kind: PermissionOverwriteType) -> PermissionOverwrite {
    PermissionOverwrite {
        allow: Permissions::VIEW_CHANNEL
            | Permissions::SEND_MESSAGES
            | Permissions::READ_MESSAGE_HISTORY
            | Permissions::ATTACH_FILES,
        deny: Permissions::empty(),
        kind,
    }
}

async fn respond_ephemeral(
    ctx: &serenity::Context,
    interaction: &serenity::ComponentInteraction,
    content: impl Into<String>,
) -> Result<(), Error> {
    interaction
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

/// Support tickets
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    subcommands("ticket_setup", "ticket_close", "ticket_add")
)]
pub async fn ticket(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Post the ticket panel in this channel
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "setup",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn ticket_setup(
    ctx: Context<'_>,
    #[description = "Category new tickets go into"]
    #[channel_types("Category")]
    category: serenity::GuildChannel,
    #[description = "Role that can see every ticket"] staff_role: serenity::Role,
) -> Result<(), Error> {
    log::info!("Ticket setup by {}", ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    if category.kind != ChannelType::Category {
        ctx.say("❌ Please pick a category, not a regular channel!").await?;
        return Ok(());
    }

    save_ticket_settings(
        &ctx.data().db,
        guild_id.get(),
        TicketSettings {
            category_id: id(category.id.get()),
            staff_role_id: id(staff_role.id.get()),
        },
    )
    .await?;

    let panel = CreateMessage::new()
        .embed(
            CreateEmbed::new()
                .title("🎫 Need help?")
                .description("Press the button below to open a private ticket with the staff team.")
                .color(Color::BLUE),
        )
        .components(vec![CreateActionRow::Buttons(vec![CreateButton::new(OPEN_BUTTON_ID)
            .label("Open ticket")
            .emoji('🎫')
            .style(ButtonStyle::Primary)])]);
    ctx.channel_id().send_message(ctx.http(), panel).await?;

    ctx.send(
        poise::CreateReply::default()
            .content(format!(
                "✅ Tickets will open in **{}** for <@&{}>.",
                category.name, staff_role.id
            ))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Close the ticket in this channel
#[poise::command(prefix_command, slash_command, guild_only, rename = "close")]
pub async fn ticket_close(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Ticket close command by {}", ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let pool = &ctx.data().db;
    let Some(ticket) = ticket_in_channel(pool, ctx.channel_id().get()).await? else {
        ctx.say("❌ This channel isn't a ticket.").await?;
        return Ok(());
    };

    let member = ctx.author_member().await;
    let allowed = can_close(pool, guild_id.get(), &ticket, ctx.author().id, member.as_deref()).await?
        || author_has_permission(ctx, Permissions::MANAGE_CHANNELS).await;
    if !allowed {
        ctx.say("❌ Only the ticket owner or staff can close this ticket.").await?;
        return Ok(());
    }

    ctx.say("🔒 Closing ticket...").await?;
    close(&ctx.serenity_context().http, pool, guild_id, ticket, ctx.author().id).await
}

/// Add someone to this ticket
#[poise::command(prefix_command, slash_command, guild_only, rename = "add")]
pub async fn ticket_add(
    ctx: Context<'_>,
    #[description = "Member to add"] user: serenity::User,
) -> Result<(), Error> {
    log::info!("Ticket add of {} by {}", user.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let pool = &ctx.data().db;
    if ticket_in_channel(pool, ctx.channel_id().get()).await?.is_none() {
        ctx.say("❌ This channel isn't a ticket.").await?;
        return Ok(());
    }

    let member = ctx.author_member().await;
    let is_staff = match (ticket_settings(pool, guild_id.get()).await?, member.as_deref()) {
        (Some(settings), Some(member)) => member
            .roles
            .contains(&serenity::RoleId::new(settings.staff_role_id as u64)),
        _ => false,
    };
    if !is_staff && !author_has_permission(ctx, Permissions::MANAGE_CHANNELS).await {
        ctx.say("❌ Only staff can add members to a ticket.").await?;
        return Ok(());
    }

    ctx.channel_id()
        .create_permission(
            ctx.http(),
            visible_to(PermissionOverwriteType::Member(user.id)),
        )
        .await?;
    ctx.say(format!("➕ <@{}> was added to this ticket.", user.id)).await?;
    Ok(())
}

async fn can_close(
    pool: &SqlitePool,
    guild_id: u64,
    ticket: &OpenTicket,
    user_id: serenity::UserId,
    member: Option<&serenity::Member>,
) -> Result<bool, Error> {
    if ticket.user_id == id(user_id.get()) {
        return Ok(true);
    }
    let Some(member) = member else {
        return Ok(false);
    };
    if member_has_permission(Some(member), Permissions::MANAGE_CHANNELS) {
        return Ok(true);
    }
    let staff = ticket_settings(pool, guild_id)
        .await?
        .map(|s| member.roles.contains(&serenity::RoleId::new(s.staff_role_id as u64)))
        .unwrap_or(false);
    Ok(staff)
}

async fn close(
    http: &serenity::Http,
    pool: &SqlitePool,
    guild_id: serenity::GuildId,
    ticket: OpenTicket,
    closed_by: serenity::UserId,
) -> Result<(), Error> {
    let channel_id = serenity::ChannelId::new(ticket.channel_id as u64);
    if !remove_ticket(pool, channel_id.get()).await? {
        // Someone else closed it first
        return Ok(());
    }
    channel_id.delete(http).await?;

    log::info!("Ticket {} in guild {} closed by {}", channel_id, guild_id, closed_by);
    let embed = CreateEmbed::new()
        .title("🎫 Ticket closed")
        .color(Color::DARK_GREY)
        .field("Opened by", format!("<@{}>", ticket.user_id), true)
        .field("Closed by", format!("<@{closed_by}>"), true)
        .field("Opened", format!("<t:{}:R>", ticket.opened_at), true);
    send_log(http, pool, guild_id, embed).await
}

pub async fn handle_open_button(
    ctx: &serenity::Context,
    interaction: &serenity::ComponentInteraction,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = interaction.guild_id else {
        return Ok(());
    };
    let pool = &data.db;
    let user = &interaction.user;

    let Some(settings) = ticket_settings(pool, guild_id.get()).await? else {
        return respond_ephemeral(ctx, interaction, "❌ Tickets aren't set up on this server.").await;
    };
    if let Some(existing) = open_ticket_for(pool, guild_id.get(), user.id.get()).await? {
        return respond_ephemeral(
            ctx,
            interaction,
            format!("❌ You already have an open ticket: <#{}>", existing.channel_id),
        )
        .await;
    }

    let bot_id = ctx.cache.current_user().id;
    let overwrites = vec![
        PermissionOverwrite {
            allow: Permissions::empty(),
            deny: Permissions::VIEW_CHANNEL,
            kind: PermissionOverwriteType::Role(guild_id.everyone_role()),
        },
        visible_to(PermissionOverwriteType::Member(user.id)),
        visible_to(PermissionOverwriteType::Member(bot_id)),
        visible_to(PermissionOverwriteType::Role(serenity::RoleId::new(
            settings.staff_role_id as u64,
        ))),
    ];

    let channel = guild_id
        .create_channel(
            &ctx.http,
            CreateChannel::new(ticket_channel_name(&user.name))
                .kind(ChannelType::Text)
                .category(serenity::ChannelId::new(settings.category_id as u64))
                .topic(format!("Ticket for {} ({})", user.name, user.id))
                .permissions(overwrites),
        )
        .await?;

    let recorded = record_ticket(
        pool,
        OpenTicket {
            channel_id: id(channel.id.get()),
            guild_id: id(guild_id.get()),
            user_id: id(user.id.get()),
            opened_at: now_ts(),
        },
    )
    .await;
    if let Err(e) = recorded {
        // A second click raced this one and won
        log::warn!("Discarding duplicate ticket channel for {}: {}", user.name, e);
        channel.delete(&ctx.http).await?;
        return respond_ephemeral(ctx, interaction, "❌ You already have an open ticket.").await;
    }

    let greeting = CreateMessage::new()
        .content(format!("<@{}> <@&{}>", user.id, settings.staff_role_id))
        .embed(
            CreateEmbed::new()
                .title("🎫 Ticket opened")
                .description("Describe your issue and a staff member will be with you shortly.")
                .color(Color::BLUE),
        )
        .components(vec![CreateActionRow::Buttons(vec![CreateButton::new(CLOSE_BUTTON_ID)
            .label("Close")
            .emoji('🔒')
            .style(ButtonStyle::Danger)])]);
    channel.send_message(&ctx.http, greeting).await?;

    log::info!("Ticket {} opened by {} in guild {}", channel.id, user.name, guild_id);
    respond_ephemeral(ctx, interaction, format!("✅ Your ticket is ready: <#{}>", channel.id)).await
}

pub async fn handle_close_button(
    ctx: &serenity::Context,
    interaction: &serenity::ComponentInteraction,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = interaction.guild_id else {
        return Ok(());
    };
    let pool = &data.db;
    let Some(ticket) = ticket_in_channel(pool, interaction.channel_id.get()).await? else {
        return respond_ephemeral(ctx, interaction, "❌ This ticket is already closed.").await;
    };

    let member = interaction.member.as_ref();
    if !can_close(pool, guild_id.get(), &ticket, interaction.user.id, member).await? {
        return respond_ephemeral(ctx, interaction, "❌ Only the ticket owner or staff can close this ticket.").await;
    }

    respond_ephemeral(ctx, interaction, "🔒 Closing ticket...").await?;
    close(&ctx.http, pool, guild_id, ticket, interaction.user.id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn test_ticket_channel_name() {
        assert_eq!(ticket_channel_name("Alice"), "ticket-alice");
        assert_eq!(ticket_channel_name("bob.the_builder"), "ticket-bobthe_builder");
        assert_eq!(ticket_channel_name("日本"), "ticket");
    }

    #[tokio::test]
    async fn test_ticket_rows() {
        let pool = test_pool().await;
        assert_eq!(ticket_settings(&pool, 1).await.unwrap(), None);

        let settings = TicketSettings {
            category_id: 10,
            staff_role_id: 20,
        };
        save_ticket_settings(&pool, 1, settings).await.unwrap();
        assert_eq!(ticket_settings(&pool, 1).await.unwrap(), Some(settings));

        let ticket = OpenTicket {
            channel_id: 100,
            guild_id: 1,
            user_id: 5,
            opened_at: 1_000,
        };
        record_ticket(&pool, ticket).await.unwrap();
        assert_eq!(open_ticket_for(&pool, 1, 5).await.unwrap(), Some(ticket));
        assert_eq!(open_ticket_for(&pool, 2, 5).await.unwrap(), None);
        assert_eq!(ticket_in_channel(&pool, 100).await.unwrap(), Some(ticket));

        let duplicate = OpenTicket {
            channel_id: 101,
            ..ticket
        };
        assert!(record_ticket(&pool, duplicate).await.is_err());

        assert!(remove_ticket(&pool, 100).await.unwrap());
        assert!(!remove_ticket(&pool, 100).await.unwrap());
        assert_eq!(open_ticket_for(&pool, 1, 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_owner_can_close_without_member_data() {
        let pool = test_pool().await;
        let ticket = OpenTicket {
            channel_id: 100,
            guild_id: 1,
            user_id: 5,
            opened_at: 0,
        };
        assert!(can_close(&pool, 1, &ticket, serenity::UserId::new(5), None).await.unwrap());
        assert!(!can_close(&pool, 1, &ticket, serenity::UserId::new(6), None).await.unwrap());
    }
}
