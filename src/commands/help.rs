use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;

type Command = poise::Command<Data, Error>;

const HELP_COLOR: u32 = 0x7289DA;

/// Top-level command names shown in the overview, grouped by module.
const CATEGORIES: &[(&str, &[&str])] = &[
    ("🏓 General", &["ping", "help", "afk", "remind", "gif"]),
    ("⭐ Leveling", &["rank", "levels"]),
    ("🪙 Economy", &["balance", "daily", "give", "richest", "coinflip", "addmoney"]),
    ("🎲 Games", &["baucua", "vtv"]),
    ("🤖 AI", &["ai"]),
    (
        "🛠️ Moderation",
        &["kick", "ban", "unban", "timeout", "untimeout", "warn", "warnings", "clearwarnings", "purge"],
    ),
    ("⚙️ Server Setup", &["logging", "ticket", "verification"]),
];

/// Shows all available commands and their descriptions
///
/// # Usage
/// - `-help` or `/help` - Show all available commands
/// - `-help command_name` - Show detailed help for a specific command
/// - `-help remind set` - Subcommands work too
#[poise::command(prefix_command, slash_command)]
pub async fn help(
    ctx: Context<'_>,
    #[description = "Specific command to show help for"]
    #[rest]
    command: Option<String>,
) -> Result<(), Error> {
    log::info!("Help command called by {}", ctx.author().name);

    let prefix = ctx.data().config.prefix.clone();
    let commands = &ctx.framework().options().commands;

    let embed = match command.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        None => general_help_embed(commands, &prefix),
        Some(name) => match find_command(commands, name) {
            Some((found, path)) => command_help_embed(found, &path, &prefix),
            None => {
                ctx.send(
                    poise::CreateReply::default()
                        .content(format!(
                            "❌ Command `{name}` not found. Use `{prefix}help` to see all available commands."
                        ))
                        .ephemeral(true),
                )
                .await?;
                return Ok(());
            }
        },
    };

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Resolve a possibly nested command path like `remind set`, returning the
/// command and its canonical path.
fn find_command<'a>(commands: &'a [Command], path: &str) -> Option<(&'a Command, String)> {
    let mut candidates = commands;
    let mut found = None;
    let mut names = Vec::new();

    for part in path.split_whitespace() {
        let part = part.trim_start_matches('/').to_lowercase();
        let command = candidates
            .iter()
            .find(|c| c.name == part || c.aliases.iter().any(|a| *a == part))?;
        candidates = &command.subcommands;
        names.push(command.name.as_str());
        found = Some(command);
    }
    found.map(|c| (c, names.join(" ")))
}

fn short_description(command: &Command) -> &str {
    command.description.as_deref().unwrap_or("No description")
}

fn category_lines(commands: &[Command], names: &[&str], prefix: &str) -> String {
    names
        .iter()
        .filter_map(|name| commands.iter().find(|c| c.name == *name))
        .map(|c| format!("• `{prefix}{}` - {}", c.name, short_description(c)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn general_help_embed(commands: &[Command], prefix: &str) -> serenity::CreateEmbed {
    let mut embed = serenity::CreateEmbed::new()
        .title("🤖 Bot Help - Available Commands")
        .description(format!(
            "Here are all the available commands you can use with this bot!\n\nUse `{prefix}help <command>` for detailed information about a specific command."
        ))
        .color(HELP_COLOR);

    for (title, names) in CATEGORIES {
        let lines = category_lines(commands, names, prefix);
        if !lines.is_empty() {
            embed = embed.field(*title, lines, false);
        }
    }

    embed
        .field(
            "💡 Tips",
            format!("• Commands work with both prefix (`{prefix}`) and slash (`/`) formats\n• Commands with subcommands list them in `{prefix}help <command>`"),
            false,
        )
        .footer(serenity::CreateEmbedFooter::new("Bot developed with Rust & Poise 🦀"))
        .timestamp(serenity::Timestamp::now())
}

fn usage(command: &Command, path: &str, prefix: &str) -> String {
    let mut usage = format!("{prefix}{path}");
    for param in &command.parameters {
        if param.required {
            usage.push_str(&format!(" <{}>", param.name));
        } else {
            usage.push_str(&format!(" [{}]", param.name));
        }
    }
    usage
}

fn command_help_embed(command: &Command, path: &str, prefix: &str) -> serenity::CreateEmbed {
    let mut embed = serenity::CreateEmbed::new()
        .title(format!("📖 Help: {path}"))
        .description(short_description(command))
        .color(HELP_COLOR)
        .field("📝 Usage", format!("`{}`", usage(command, path, prefix)), false);

    if !command.parameters.is_empty() {
        let params_text = command
            .parameters
            .iter()
            .map(|p| {
                format!(
                    "• {}{} - {}",
                    p.name,
                    if p.required { "" } else { " (optional)" },
                    p.description.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        embed = embed.field("⚙️ Parameters", params_text, false);
    }

    if !command.subcommands.is_empty() {
        let subcommands = command
            .subcommands
            .iter()
            .map(|s| {
                let sub_path = format!("{path} {}", s.name);
                format!("• `{}` - {}", usage(s, &sub_path, prefix), short_description(s))
            })
            .collect::<Vec<_>>()
            .join("\n");
        embed = embed.field("📂 Subcommands", subcommands, false);
    }

    if !command.required_permissions.is_empty() {
        embed = embed.field(
            "🔒 Requires",
            command.required_permissions.get_permission_names().join(", "),
            false,
        );
    }

    embed
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Use {prefix}help to see all commands"
        )))
        .timestamp(serenity::Timestamp::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_command_exists() {
        let commands = crate::commands::all();
        for (category, names) in CATEGORIES {
            for name in *names {
                assert!(
                    commands.iter().any(|c| c.name == *name),
                    "{name} in {category} is not registered"
                );
            }
        }
    }

    #[test]
    fn test_find_nested_command() {
        let commands = crate::commands::all();
        let (ping, path) = find_command(&commands, "ping").unwrap();
        assert_eq!((ping.name.as_str(), path.as_str()), ("ping", "ping"));

        let (set, path) = find_command(&commands, "Remind SET").unwrap();
        assert_eq!((set.name.as_str(), path.as_str()), ("set", "remind set"));

        let (balance, path) = find_command(&commands, "bal").unwrap();
        assert_eq!((balance.name.as_str(), path.as_str()), ("balance", "balance"));
        assert!(find_command(&commands, "nope").is_none());
        assert!(find_command(&commands, "remind nope").is_none());
    }

    #[test]
    fn test_usage_marks_optional_parameters() {
        let commands = crate::commands::all();
        let (set, path) = find_command(&commands, "remind set").unwrap();
        assert_eq!(usage(set, &path, "-"), "-remind set <time> [message]");
    }
}
