use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serenity::{Color, CreateEmbed, CreateEmbedFooter};
use url::Url;

const GIPHY_SEARCH_URL: &str = "https://api.giphy.com/v1/gifs/search";
const RESULT_LIMIT: u32 = 10;
const RATING: &str = "pg-13";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<GiphyGif>,
}

#[derive(Debug, Deserialize)]
struct GiphyGif {
    #[serde(default)]
    title: String,
    images: GiphyImages,
}

#[derive(Debug, Deserialize)]
struct GiphyImages {
    original: GiphyImage,
}

#[derive(Debug, Deserialize)]
struct GiphyImage {
    url: String,
}

fn search_url(api_key: &str, query: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(GIPHY_SEARCH_URL)?;
    url.query_pairs_mut()
        .append_pair("api_key", api_key)
        .append_pair("q", query)
        .append_pair("limit", &RESULT_LIMIT.to_string())
        .append_pair("rating", RATING);
    Ok(url)
}

async fn search(client: &reqwest::Client, api_key: &str, query: &str) -> Result<Vec<GiphyGif>, Error> {
    let response = client
        .get(search_url(api_key, query)?)
        .send()
        .await?
        .error_for_status()?;
    let parsed: SearchResponse = response.json().await?;
    Ok(parsed.data)
}

/// Search Giphy and post a random match
#[poise::command(prefix_command, slash_command)]
pub async fn gif(
    ctx: Context<'_>,
    #[description = "What to search for"]
    #[rest]
    query: String,
) -> Result<(), Error> {
    log::info!("Gif command called by {} with query '{}'", ctx.author().name, query);

    let query = query.trim();
    if query.is_empty() {
        ctx.say("❌ Tell me what to search for, e.g. `gif happy cat`").await?;
        return Ok(());
    }
    let Some(api_key) = ctx.data().config.giphy_api_key.as_deref() else {
        ctx.say("🙈 GIF search isn't set up on this bot.").await?;
        return Ok(());
    };

    ctx.defer().await?;
    let results = match search(&ctx.data().http_client, api_key, query).await {
        Ok(results) => results,
        Err(e) => {
            log::error!("Giphy search for '{}' failed: {}", query, e);
            ctx.say("❌ Giphy isn't answering right now, try again later.").await?;
            return Ok(());
        }
    };

    let Some(pick) = results.choose(&mut rand::thread_rng()) else {
        ctx.say(format!("🔍 No GIFs found for **{query}**.")).await?;
        return Ok(());
    };

    let title = if pick.title.trim().is_empty() {
        query.to_string()
    } else {
        pick.title.clone()
    };
    let embed = CreateEmbed::new()
        .title(title)
        .image(&pick.images.original.url)
        .color(Color::PURPLE)
        .footer(CreateEmbedFooter::new("Powered by GIPHY"));

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_url_encodes_query() {
        let url = search_url("KEY", "happy cat & dog").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("q".to_string(), "happy cat & dog".to_string())));
        assert!(pairs.contains(&("limit".to_string(), "10".to_string())));
        assert!(pairs.contains(&("rating".to_string(), "pg-13".to_string())));
        assert!(url.as_str().starts_with(GIPHY_SEARCH_URL));
    }

    #[test]
    fn test_parse_search_response() {
        let body = r#"{
            "data": [
                {"title": "Cat GIF", "images": {"original": {"url": "https://media.giphy.com/a.gif", "width": "480"}}},
                {"images": {"original": {"url": "https://media.giphy.com/b.gif"}}}
            ],
            "meta": {"status": 200}
        }"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].title, "Cat GIF");
        assert_eq!(parsed.data[1].images.original.url, "https://media.giphy.com/b.gif");

        let empty: SearchResponse = serde_json::from_str(r#"{"meta": {"status": 200}}"#).unwrap();
        assert!(empty.data.is_empty());
    }
}
