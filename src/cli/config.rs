//! Configuration management commands

use super::ConfigArgs;
use crate::config::Config;
use anyhow::Result;

pub async fn execute(args: ConfigArgs) -> Result<()> {
    if args.show {
        let config = Config::load().await?;
        println!("{}", toml::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    if args.init {
        match Config::init_default().await? {
            Some(path) => println!("Configuration initialized at {}", path.display()),
            None => anyhow::bail!("Could not determine a config directory"),
        }
        return Ok(());
    }

    // Default: show help
    println!("Use --show or --init");
    Ok(())
}
