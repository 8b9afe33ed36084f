// Commands module - one file per feature
pub mod afk;
pub mod ai;
pub mod baucua;
pub mod economy;
pub mod gif;
pub mod help;
pub mod leveling;
pub mod logging;
pub mod moderation;
pub mod ping;
pub mod remind;
pub mod tickets;
pub mod verification;
pub mod vua_tieng_viet;

use crate::{Data, Error};

// Re-export all commands for easy access from main.rs
pub use afk::afk;
pub use ai::ai;
pub use baucua::baucua;
pub use economy::{addmoney, balance, coinflip, daily, give, richest_cmd};
pub use gif::gif;
pub use help::help;
pub use leveling::{levels, rank};
pub use logging::logging;
pub use moderation::{ban, clearwarnings, kick, purge, timeout, unban, untimeout, warn, warnings};
pub use ping::ping;
pub use remind::remind;
pub use tickets::ticket;
pub use verification::verification;
pub use vua_tieng_viet::vtv;

/// Every command the framework registers.
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        ping(),
        help(),
        afk(),
        remind(),
        gif(),
        rank(),
        levels(),
        balance(),
        daily(),
        give(),
        richest_cmd(),
        addmoney(),
        coinflip(),
        baucua(),
        vtv(),
        ai(),
        kick(),
        ban(),
        unban(),
        timeout(),
        untimeout(),
        warn(),
        warnings(),
        clearwarnings(),
        purge(),
        logging(),
        ticket(),
        verification(),
    ]
}
