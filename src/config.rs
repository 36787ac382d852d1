use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9003")]
    pub listen: SocketAddr,

    /// Path of the SQLite file holding map and player state
    #[arg(long, default_value = "torusweeper.db")]
    pub store: PathBuf,

    /// World seed; the whole minefield derives from it
    #[arg(long, value_parser = parse_seed)]
    pub seed: String,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Short seeds make the field guessable; refuse them at the door.
fn parse_seed(raw: &str) -> Result<String, String> {
    if raw.chars().count() < 10 {
        Err("map seed must be at least 10 characters".to_string())
    } else {
        Ok(raw.to_string())
    }
}
