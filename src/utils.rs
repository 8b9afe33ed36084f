use chrono::{Duration, Utc};
use poise::serenity_prelude as serenity;

use crate::Context;

/// Current unix time in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Parse durations like `30s`, `5m`, `2h`, `1d`, `1w`. Values chrono
/// cannot represent are rejected.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim().to_lowercase();

    let mut number_str = String::new();
    let mut unit_str = String::new();

    for c in input.chars() {
        if c.is_ascii_digit() && unit_str.is_empty() {
            number_str.push(c);
        } else {
            unit_str.push(c);
        }
    }

    let number: i64 = number_str.parse().ok()?;
    if number <= 0 {
        return None;
    }

    match unit_str.trim() {
        "s" | "sec" | "second" | "seconds" => Duration::try_seconds(number),
        "m" | "min" | "minute" | "minutes" => Duration::try_minutes(number),
        "h" | "hr" | "hour" | "hours" => Duration::try_hours(number),
        "d" | "day" | "days" => Duration::try_days(number),
        "w" | "week" | "weeks" => Duration::try_weeks(number),
        _ => None,
    }
}

/// Compact human form of a duration, largest unit only.
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.num_seconds().max(0);

    if total_seconds < 60 {
        format!("{total_seconds}s")
    } else if total_seconds < 3600 {
        format!("{}m", total_seconds / 60)
    } else if total_seconds < 86400 {
        format!("{}h", total_seconds / 3600)
    } else {
        format!("{}d", total_seconds / 86400)
    }
}

/// Cut `text` to at most `max` characters, adding an ellipsis when shortened.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Permission check for component interactions, where poise's
/// `required_permissions` does not apply.
pub fn member_has_permission(
    member: Option<&serenity::Member>,
    permission: serenity::Permissions,
) -> bool {
    member
        .and_then(|m| m.permissions)
        .map(|p| p.administrator() || p.contains(permission))
        .unwrap_or(false)
}

/// Whether the invoking member holds `permission` (or is an administrator).
/// Slash invocations carry resolved permissions, prefix ones fall back to the cache.
pub async fn author_has_permission(ctx: Context<'_>, permission: serenity::Permissions) -> bool {
    let Some(member) = ctx.author_member().await else {
        return false;
    };
    if let Some(perms) = member.permissions {
        return perms.administrator() || perms.contains(permission);
    }
    let Some(guild) = ctx.guild() else {
        return false;
    };
    let perms = guild.member_permissions(&member);
    perms.administrator() || perms.contains(permission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_duration("1h"), Some(Duration::hours(1)));
        assert_eq!(parse_duration("2d"), Some(Duration::days(2)));
        assert_eq!(parse_duration("1w"), Some(Duration::weeks(1)));
        assert_eq!(parse_duration("30 seconds"), Some(Duration::seconds(30)));
        assert_eq!(parse_duration("0m"), None);
        assert_eq!(parse_duration("m5"), None);
        assert_eq!(parse_duration("invalid"), None);
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        assert_eq!(parse_duration("9999999999999999s"), None);
        assert_eq!(parse_duration("99999999999999w"), None);
        assert_eq!(parse_duration("99999999999999999999999m"), None);
        assert!(parse_duration("9999999999s").is_some());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(30)), "30s");
        assert_eq!(format_duration(Duration::minutes(5)), "5m");
        assert_eq!(format_duration(Duration::hours(2)), "2h");
        assert_eq!(format_duration(Duration::days(1)), "1d");
        assert_eq!(format_duration(Duration::seconds(-4)), "0s");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
        assert_eq!(truncate("tiếng việt", 5).chars().count(), 5);
    }
}
