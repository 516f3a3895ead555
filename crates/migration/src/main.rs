use config::{Config, ConfigError, Environment, File, FileFormat, FileSourceFile};
use sea_orm_migration::prelude::*;
use std::env;

/// `database_url` as the consumer service sees it: `config.yaml` overlaid by
/// `DATABASE_URL`-style environment overrides.
fn service_database_url(
    source: File<FileSourceFile, FileFormat>,
) -> Result<Option<String>, ConfigError> {
    let settings = Config::builder()
        .add_source(source.required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;
    match settings.get_string("database_url") {
        Ok(url) => Ok(Some(url)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() {
    if env::var("DATABASE_URL").is_err() {
        match service_database_url(File::with_name("config.yaml")) {
            Ok(Some(url)) => env::set_var("DATABASE_URL", url),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Cannot read the consumer configuration: {e}");
                std::process::exit(1);
            }
        }
    }
    cli::run_cli(migration::Migrator).await;
}
