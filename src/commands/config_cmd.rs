use clap::{Args, Subcommand, ValueEnum};

use crm_mirror::config::{Config, ConfigValue};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

fn print_value<T: std::fmt::Display>(key: &str, value: &ConfigValue<T>) {
    println!("{}: {}", key, value.value);
    println!("  source: {}", value.source);
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        print_value("run_service", &config.run_service);
                        print_value("poll_interval_secs", &config.poll_interval_secs);
                        println!("entity_types: {}", config.entity_types.value.join(", "));
                        println!("  source: {}", config.entity_types.source);
                        print_value(
                            "process_entity_types_concurrently",
                            &config.process_entity_types_concurrently,
                        );
                        match config.max_parallelism.value {
                            Some(n) => println!("max_parallelism: {}", n),
                            None => println!("max_parallelism: (all entity types)"),
                        }
                        println!("  source: {}", config.max_parallelism.source);
                        print_value("ignore_invalid_data", &config.ignore_invalid_data);
                        print_value("failure_policy", &config.failure_policy);
                        print_value("target_connection_string", &config.target_connection_string);
                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!();

                        println!("source:");
                        println!(
                            "  url: {}",
                            config.source.url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "  access_token: {}",
                            if config.source.access_token.is_some() {
                                "(set)"
                            } else {
                                "(not set)"
                            }
                        );
                        println!("  scope_key: {}", config.source.scope_key);
                        println!("  page_size: {}", config.source.page_size);
                    }
                }
                Ok(())
            }
        }
    }
}
