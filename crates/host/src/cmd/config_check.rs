//! `config-check` subcommand: loads and validates a config file without
//! starting the daemon.

use anyhow::Result;

use program_host::config::Configuration;

pub async fn run(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)?;

    println!("Configuration OK: {}", config_path);
    println!("  listen_addr: {}", config.listen_addr);
    println!("  storage_dir: {}", config.storage_dir.display());
    println!("  port_range: {}-{}", config.port_range.start, config.port_range.end);
    println!("  build_timeout: {:?}", config.build_timeout);
    println!("  start_timeout: {:?}", config.start_timeout);
    println!("  shutdown_deadline: {:?}", config.shutdown_deadline);
    println!("  docker.socket: {}", config.docker.socket);
    println!("  docker.network: {}", config.docker.network.name);

    Ok(())
}
