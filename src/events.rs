use crate::commands::{afk, ai, leveling, logging, tickets, verification, vua_tieng_viet};
use crate::{Data, Error};
use poise::serenity_prelude as serenity;
use serenity::FullEvent;

/// Route gateway events to the feature listeners. Listener failures are
/// logged and never stop the other listeners.
pub async fn handle_event(ctx: &serenity::Context, event: &FullEvent, data: &Data) {
    match event {
        FullEvent::Message { new_message } => {
            if new_message.author.bot {
                return;
            }
            logging::remember_message(new_message).await;
            report("afk", afk::on_message(ctx, new_message, data).await);
            report("leveling", leveling::on_message(ctx, new_message, data).await);
            report(
                "vua tieng viet",
                vua_tieng_viet::on_message(ctx, new_message, data).await,
            );
            report("ai chat", ai::on_message(ctx, new_message, data).await);
        }
        FullEvent::MessageDelete {
            channel_id,
            deleted_message_id,
            guild_id,
        } => {
            report(
                "message delete log",
                logging::on_message_delete(ctx, *channel_id, *deleted_message_id, *guild_id, data)
                    .await,
            );
        }
        // `new` is only filled from the message cache, the raw event always arrives
        FullEvent::MessageUpdate { event, .. } => {
            report(
                "message edit log",
                logging::on_message_update(ctx, event, data).await,
            );
        }
        FullEvent::GuildMemberAddition { new_member } => {
            report(
                "member join log",
                logging::on_member_join(ctx, new_member, data).await,
            );
        }
        FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            report(
                "member leave log",
                logging::on_member_leave(ctx, *guild_id, user, data).await,
            );
        }
        FullEvent::InteractionCreate { interaction } => {
            let Some(component) = interaction.as_message_component() else {
                return;
            };
            let result = match component.data.custom_id.as_str() {
                tickets::OPEN_BUTTON_ID => tickets::handle_open_button(ctx, component, data).await,
                tickets::CLOSE_BUTTON_ID => tickets::handle_close_button(ctx, component, data).await,
                verification::VERIFY_BUTTON_ID => {
                    verification::handle_verify_button(ctx, component, data).await
                }
                other => {
                    log::debug!("Ignoring unknown component {}", other);
                    Ok(())
                }
            };
            report("button", result);
        }
        _ => {}
    }
}

fn report(listener: &str, result: Result<(), Error>) {
    if let Err(e) = result {
        log::error!("Error in {} listener: {}", listener, e);
    }
}
