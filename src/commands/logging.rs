use crate::db::id;
use crate::utils::truncate;
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use serenity::{Color, CreateEmbed, CreateEmbedFooter, CreateMessage};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

const SNAPSHOT_CAPACITY: usize = 5000;

// Content of recent messages, kept because the gateway delete event only carries ids
lazy_static::lazy_static! {
    static ref SNAPSHOTS: RwLock<MessageSnapshots> = RwLock::new(MessageSnapshots::new(SNAPSHOT_CAPACITY));
}

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    author_id: u64,
    content: String,
}

/// Bounded id -> content map, oldest entries evicted first.
struct MessageSnapshots {
    capacity: usize,
    order: VecDeque<u64>,
    messages: HashMap<u64, Snapshot>,
}

impl MessageSnapshots {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            messages: HashMap::new(),
        }
    }

    fn insert(&mut self, message_id: u64, snapshot: Snapshot) {
        if self.messages.insert(message_id, snapshot).is_none() {
            self.order.push_back(message_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.messages.remove(&oldest);
            }
        }
    }

    fn take(&mut self, message_id: u64) -> Option<Snapshot> {
        let snapshot = self.messages.remove(&message_id)?;
        self.order.retain(|id| *id != message_id);
        Some(snapshot)
    }
}

/// Remember a guild message so its content can be logged if it is deleted.
pub async fn remember_message(msg: &serenity::Message) {
    if msg.guild_id.is_none() || msg.author.bot {
        return;
    }
    SNAPSHOTS.write().await.insert(
        msg.id.get(),
        Snapshot {
            author_id: msg.author.id.get(),
            content: msg.content.clone(),
        },
    );
}

pub async fn log_channel(pool: &SqlitePool, guild_id: u64) -> Result<Option<serenity::ChannelId>, sqlx::Error> {
    let channel: Option<i64> = sqlx::query_scalar("SELECT channel_id FROM log_settings WHERE guild_id = ?")
        .bind(id(guild_id))
        .fetch_optional(pool)
        .await?;
    Ok(channel.map(|c| serenity::ChannelId::new(c as u64)))
}

async fn set_log_channel(pool: &SqlitePool, guild_id: u64, channel_id: Option<u64>) -> Result<(), sqlx::Error> {
    match channel_id {
        Some(channel_id) => {
            sqlx::query("INSERT OR REPLACE INTO log_settings (guild_id, channel_id) VALUES (?, ?)")
                .bind(id(guild_id))
                .bind(id(channel_id))
                .execute(pool)
                .await?;
        }
        None => {
            sqlx::query("DELETE FROM log_settings WHERE guild_id = ?")
                .bind(id(guild_id))
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Post `embed` to the guild's log channel. Does nothing when logging is off;
/// delivery failures are only logged.
pub async fn send_log(
    http: &serenity::Http,
    pool: &SqlitePool,
    guild_id: serenity::GuildId,
    embed: CreateEmbed,
) -> Result<(), Error> {
    let Some(channel) = log_channel(pool, guild_id.get()).await? else {
        return Ok(());
    };
    if let Err(e) = channel
        .send_message(http, CreateMessage::new().embed(embed.timestamp(serenity::Timestamp::now())))
        .await
    {
        log::warn!("Failed to write to log channel {} in guild {}: {}", channel, guild_id, e);
    }
    Ok(())
}

/// Server event log
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("logging_channel", "logging_disable")
)]
pub async fn logging(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Send server events to a channel
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "channel",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn logging_channel(
    ctx: Context<'_>,
    #[description = "Log channel"] channel: serenity::GuildChannel,
) -> Result<(), Error> {
    log::info!("Log channel set to {} by {}", channel.name, ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    set_log_channel(&ctx.data().db, guild_id.get(), Some(channel.id.get())).await?;
    ctx.say(format!("📝 Server events will be logged in <#{}>.", channel.id))
        .await?;
    Ok(())
}

/// Stop logging server events
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    rename = "disable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn logging_disable(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Logging disabled by {}", ctx.author().name);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    set_log_channel(&ctx.data().db, guild_id.get(), None).await?;
    ctx.say("🔕 Server logging disabled.").await?;
    Ok(())
}

fn quote(content: &str) -> String {
    if content.is_empty() {
        "*(no text)*".to_string()
    } else {
        truncate(content, 1000)
    }
}

pub async fn on_message_delete(
    ctx: &serenity::Context,
    channel_id: serenity::ChannelId,
    message_id: serenity::MessageId,
    guild_id: Option<serenity::GuildId>,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = guild_id else {
        return Ok(());
    };

    let snapshot = SNAPSHOTS.write().await.take(message_id.get());

    let mut embed = CreateEmbed::new()
        .title("🗑️ Message deleted")
        .color(Color::RED)
        .field("Channel", format!("<#{channel_id}>"), true)
        .footer(CreateEmbedFooter::new(format!("Message ID: {message_id}")));

    match snapshot {
        Some(snapshot) => {
            embed = embed
                .field("Author", format!("<@{}>", snapshot.author_id), true)
                .field("Content", quote(&snapshot.content), false);
        }
        None => {
            embed = embed.field("Content", "*(not cached)*", false);
        }
    }

    send_log(&ctx.http, &data.db, guild_id, embed).await
}

/// What an edit changed, resolved from the update event and the snapshot store.
#[derive(Debug, PartialEq)]
struct EditedMessage {
    guild_id: serenity::GuildId,
    channel_id: serenity::ChannelId,
    message_id: serenity::MessageId,
    author_id: Option<u64>,
    before: Option<String>,
    after: String,
}

/// Resolve an update event into an edit worth logging. The gateway event only
/// carries changed fields, so the previous content comes from the snapshot
/// store, which is refreshed with the new content.
async fn edited_message(event: &serenity::MessageUpdateEvent) -> Option<EditedMessage> {
    let guild_id = event.guild_id?;
    // Updates without content are embed resolutions and similar
    let after = event.content.clone()?;
    if event.author.as_ref().is_some_and(|author| author.bot) {
        return None;
    }

    let mut snapshots = SNAPSHOTS.write().await;
    let previous = snapshots.take(event.id.get());
    let author_id = event
        .author
        .as_ref()
        .map(|author| author.id.get())
        .or(previous.as_ref().map(|s| s.author_id));
    if let Some(author_id) = author_id {
        snapshots.insert(
            event.id.get(),
            Snapshot {
                author_id,
                content: after.clone(),
            },
        );
    }
    drop(snapshots);

    let before = previous.map(|s| s.content);
    if before.as_deref() == Some(after.as_str()) {
        return None;
    }

    Some(EditedMessage {
        guild_id,
        channel_id: event.channel_id,
        message_id: event.id,
        author_id,
        before,
        after,
    })
}

pub async fn on_message_update(
    ctx: &serenity::Context,
    event: &serenity::MessageUpdateEvent,
    data: &Data,
) -> Result<(), Error> {
    let Some(edit) = edited_message(event).await else {
        return Ok(());
    };

    let author = edit
        .author_id
        .map(|author_id| format!("<@{author_id}>"))
        .unwrap_or_else(|| "*(unknown)*".to_string());
    let embed = CreateEmbed::new()
        .title("✏️ Message edited")
        .color(Color::ORANGE)
        .field("Author", author, true)
        .field("Channel", format!("<#{}>", edit.channel_id), true)
        .field(
            "Before",
            edit.before.as_deref().map(quote).unwrap_or_else(|| "*(not cached)*".to_string()),
            false,
        )
        .field("After", quote(&edit.after), false)
        .footer(CreateEmbedFooter::new(format!("Message ID: {}", edit.message_id)));

    send_log(&ctx.http, &data.db, edit.guild_id, embed).await
}

pub async fn on_member_join(
    ctx: &serenity::Context,
    member: &serenity::Member,
    data: &Data,
) -> Result<(), Error> {
    let created = member.user.created_at().unix_timestamp();
    let embed = CreateEmbed::new()
        .title("📥 Member joined")
        .color(Color::DARK_GREEN)
        .thumbnail(member.user.face())
        .description(format!("<@{}> ({})", member.user.id, member.user.name))
        .field("Account created", format!("<t:{created}:R>"), true);

    send_log(&ctx.http, &data.db, member.guild_id, embed).await
}

pub async fn on_member_leave(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    user: &serenity::User,
    data: &Data,
) -> Result<(), Error> {
    let embed = CreateEmbed::new()
        .title("📤 Member left")
        .color(Color::DARK_GREY)
        .thumbnail(user.face())
        .description(format!("<@{}> ({})", user.id, user.name));

    send_log(&ctx.http, &data.db, guild_id, embed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_log_channel_set_and_clear() {
        let pool = test_pool().await;
        assert_eq!(log_channel(&pool, 1).await.unwrap(), None);

        set_log_channel(&pool, 1, Some(42)).await.unwrap();
        assert_eq!(log_channel(&pool, 1).await.unwrap(), Some(serenity::ChannelId::new(42)));

        set_log_channel(&pool, 1, Some(43)).await.unwrap();
        assert_eq!(log_channel(&pool, 1).await.unwrap(), Some(serenity::ChannelId::new(43)));

        set_log_channel(&pool, 1, None).await.unwrap();
        assert_eq!(log_channel(&pool, 1).await.unwrap(), None);
    }

    #[test]
    fn test_snapshots_evict_oldest() {
        let mut snapshots = MessageSnapshots::new(2);
        let snap = |content: &str| Snapshot {
            author_id: 7,
            content: content.to_string(),
        };
        snapshots.insert(1, snap("one"));
        snapshots.insert(2, snap("two"));
        snapshots.insert(2, snap("two edited"));
        snapshots.insert(3, snap("three"));

        assert_eq!(snapshots.take(1), None);
        assert_eq!(snapshots.take(2).map(|s| s.content).as_deref(), Some("two edited"));
        assert_eq!(snapshots.take(2), None);
        assert_eq!(snapshots.take(3).map(|s| s.author_id), Some(7));
        assert!(snapshots.order.is_empty());
    }

    fn update_event(message_id: u64, content: Option<&str>) -> serenity::MessageUpdateEvent {
        let mut event = serde_json::json!({
            "id": message_id.to_string(),
            "channel_id": "20",
            "guild_id": "30",
        });
        if let Some(content) = content {
            event["content"] = serde_json::Value::from(content);
        }
        serde_json::from_value(event).unwrap()
    }

    #[tokio::test]
    async fn test_edit_resolved_from_update_event() {
        SNAPSHOTS.write().await.insert(
            9_001,
            Snapshot {
                author_id: 7,
                content: "before".to_string(),
            },
        );

        let edit = edited_message(&update_event(9_001, Some("after"))).await.unwrap();
        assert_eq!(edit.guild_id, serenity::GuildId::new(30));
        assert_eq!(edit.channel_id, serenity::ChannelId::new(20));
        assert_eq!(edit.author_id, Some(7));
        assert_eq!(edit.before.as_deref(), Some("before"));
        assert_eq!(edit.after, "after");

        // The snapshot now holds the edited text
        let second = edited_message(&update_event(9_001, Some("again"))).await.unwrap();
        assert_eq!(second.before.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_edit_without_snapshot_or_content() {
        let edit = edited_message(&update_event(9_002, Some("fresh"))).await.unwrap();
        assert_eq!(edit.author_id, None);
        assert_eq!(edit.before, None);

        assert_eq!(edited_message(&update_event(9_003, None)).await, None);

        SNAPSHOTS.write().await.insert(
            9_004,
            Snapshot {
                author_id: 7,
                content: "same".to_string(),
            },
        );
        assert_eq!(edited_message(&update_event(9_004, Some("same"))).await, None);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote(""), "*(no text)*");
        assert_eq!(quote("hi"), "hi");
        assert_eq!(quote(&"x".repeat(2000)).chars().count(), 1000);
    }
}
