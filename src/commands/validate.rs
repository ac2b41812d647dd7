use std::path::Path;
use workspace_host::{config::BlobStoreConfig, Parser as ConfigParser};

pub fn run_validate(config_path: Option<&Path>) -> anyhow::Result<()> {
    let parser = ConfigParser::new();
    let config_path = match parser.find_config_file(config_path)? {
        Some(path) => path,
        None => {
            eprintln!("Error: No configuration file found");
            eprintln!(
                "\nSearched for {} in {}",
                workspace_host::config::DEFAULT_CONFIG_FILE,
                std::env::current_dir()?.display()
            );
            eprintln!("\nHint: Pass --config or run without a file to use the defaults");
            return Err(anyhow::anyhow!("Configuration file not found"));
        }
    };

    println!("Validating {}...", config_path.display());

    let config = match parser.load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration is invalid");
            return Err(e.into());
        }
    };

    println!("Configuration is valid\n");

    println!("State directory: {}", config.state_dir.display());
    println!("Workspace homes: {}", config.workspaces_root().display());
    println!(
        "Port range:      {}-{} ({} ports)",
        config.port_range.min,
        config.port_range.max,
        config.port_range.len()
    );
    match &config.defaults.image {
        Some(image) => println!("Default image:   {}", image),
        None => println!("Default image:   (none, every workspace must configure one)"),
    }
    match &config.blob_store {
        BlobStoreConfig::Filesystem { path } => {
            let path = path.clone().unwrap_or_else(|| config.state_dir.join("logs"));
            println!("Log archive:     {}", path.display());
        }
        BlobStoreConfig::Http { url, .. } => println!("Log archive:     {}", url),
    }

    Ok(())
}
