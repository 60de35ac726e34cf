use qqgate_core::{Config, Paths, Result, SecretSource};

pub async fn run() -> Result<()> {
    let paths = Paths::new();
    let config = Config::load(&paths)?;

    if config.accounts.is_empty() {
        println!("No accounts configured ({})", paths.config_file().display());
        return Ok(());
    }

    println!("{:<16} {:<12} {:<10} {:<10} {}", "ACCOUNT", "APP ID", "ENABLED", "SECRET", "MARKDOWN");
    for account in &config.accounts {
        let secret = match account.secret_source {
            _ if account.client_secret.is_empty() => "missing",
            SecretSource::Config => "config",
            SecretSource::File => "file",
            SecretSource::Env => "env",
            SecretSource::None => "missing",
        };
        println!(
            "{:<16} {:<12} {:<10} {:<10} {}",
            account.id,
            account.app_id,
            if account.enabled { "yes" } else { "no" },
            secret,
            if account.markdown_support { "yes" } else { "no" },
        );
    }
    Ok(())
}
