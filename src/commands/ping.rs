use crate::{Context, Error};

/// Check that the bot is alive and how fast it answers
#[poise::command(prefix_command, slash_command)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    log::info!("Ping command called by {}", ctx.author().name);

    let start_time = std::time::Instant::now();
    let reply = ctx.say("🏓 Pong!").await?;
    let round_trip = start_time.elapsed().as_millis();

    // Zero until the first heartbeat ack
    let gateway = ctx.ping().await.as_millis();
    let content = if gateway == 0 {
        format!("🏓 Pong! `{round_trip}ms`")
    } else {
        format!("🏓 Pong! `{round_trip}ms` (gateway `{gateway}ms`)")
    };

    reply
        .edit(ctx, poise::CreateReply::default().content(content))
        .await?;
    Ok(())
}
