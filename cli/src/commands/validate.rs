use anyhow::Result;
use clap::Args;
use std::process::ExitCode;
use tierdump_backends::BackendRegistry;

#[derive(Args)]
pub struct ValidateCommand {
    #[arg(long, help = "Also check that every destination type is known")]
    strict: bool,
}

impl ValidateCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<ExitCode> {
        let config = super::load_config(cli)?;

        if self.strict {
            let registry = BackendRegistry::with_defaults();
            let kinds = registry.kinds();
            let unknown: Vec<&str> = config
                .storage
                .destinations
                .iter()
                .filter(|d| !kinds.contains(&d.kind.as_str()))
                .map(|d| d.name.as_str())
                .collect();
            if !unknown.is_empty() {
                eprintln!("Unknown destination type for: {}", unknown.join(", "));
                eprintln!("Known types: {}", kinds.join(", "));
                return Ok(ExitCode::FAILURE);
            }
        }

        let enabled = config.enabled_databases().count();
        println!("Configuration OK: {}", cli.config.display());
        println!(
            "  Databases: {} ({} enabled)",
            config.databases.len(),
            enabled
        );
        if config.storage.destinations.is_empty() {
            if let Some(dir) = &config.backup_dir {
                println!("  Destination: local directory {}", dir.display());
            }
        } else {
            for dest in &config.storage.destinations {
                let state = if dest.enabled { "" } else { " (disabled)" };
                println!("  Destination: {} [{}]{}", dest.name, dest.kind, state);
            }
        }
        println!("  Max concurrent backups: {}", config.max_concurrent_backups());

        Ok(ExitCode::SUCCESS)
    }
}
