mod actions;
mod briefing;
mod calendar;
mod classifier;
mod config;
mod daemon;
mod emailscan;
mod embeddings;
mod error;
mod gateway;
mod goals;
mod killswitch;
mod parser;
mod pipeline;
mod providers;
mod queryanswer;
mod queue;
mod scheduler;
mod server;
mod store;
mod tasks;
mod types;
mod validator;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("config.toml");
    match args.get(1).map(String::as_str) {
        Some("--version") | Some("-V") => {
            println!("attache {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") => {
            println!("attache {}", env!("CARGO_PKG_VERSION"));
            println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
            println!("Usage: attache [CONFIG_PATH]\n");
            println!("Options:");
            println!("  -h, --help       Print help");
            println!("  -V, --version    Print version");
            return Ok(());
        }
        Some(path) => {
            config_path = PathBuf::from(path);
        }
        None => {}
    }

    let config = config::AppConfig::load(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(daemon::run(config))
}
