use clap::Parser;

use faktory_rs::config::{Config, DEFAULT_BIND};
use faktory_rs::manager::{DEFAULT_DEAD_MAX_AGE_DAYS, DEFAULT_DEAD_MAX_SIZE};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address (host:port) to listen on.
    #[arg(short, long, default_value = DEFAULT_BIND)]
    pub bind: String,
    /// Password required of clients during the handshake. Falls back to
    /// `FAKTORY_PASSWORD` if unset; an unset password leaves the server
    /// open to any client.
    #[arg(long, env = "FAKTORY_PASSWORD")]
    pub password: Option<String>,
    /// Maximum number of jobs kept in the dead set before the oldest are
    /// dropped.
    #[arg(long, default_value_t = DEFAULT_DEAD_MAX_SIZE)]
    pub dead_set_max_size: u64,
    /// Maximum age, in days, a job may sit in the dead set before it's
    /// dropped regardless of the size cap.
    #[arg(long, default_value_t = DEFAULT_DEAD_MAX_AGE_DAYS)]
    pub dead_set_max_age_days: i64,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            bind: args.bind,
            password: args.password,
            dead_set_max_size: args.dead_set_max_size,
            dead_set_max_age_days: args.dead_set_max_age_days,
        }
    }
}
