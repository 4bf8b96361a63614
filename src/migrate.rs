use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::sink::sqlite::SqliteSink;
use crate::sink::{provision, Provisioned};

/// The `init` command: create both relations if they are missing.
pub async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let sink = SqliteSink::new(pool.clone());
    let outcome = provision(&sink).await;
    pool.close().await;

    for (relation, state) in outcome? {
        let state = match state {
            Provisioned::Exists => "exists",
            Provisioned::Created => "created",
        };
        println!("  {}: {}", relation, state);
    }
    println!("Database initialized successfully.");
    Ok(())
}
