//! Database maintenance commands: `placescout init-db` and `placescout prune`.

use anyhow::Result;

use placescout::config::ServiceConfig;
use placescout::db::DbHandle;
use placescout::pipeline::PipelineRunner;
use placescout::server::open_database;

pub fn cmd_init_db(config: &ServiceConfig) -> Result<()> {
    open_database(&config.database)?;
    println!("Database initialized at {}", config.database.path.display());
    Ok(())
}

pub async fn cmd_prune(config: &ServiceConfig) -> Result<()> {
    if config.pipeline.retention_days <= 0 {
        println!("Retention is disabled; nothing pruned.");
        return Ok(());
    }
    let db = DbHandle::new(open_database(&config.database)?);
    let runner = PipelineRunner::new(db, config.pipeline.clone(), config.callback_base_url());
    let deleted = runner.prune().await?;
    println!(
        "Pruned {} pipeline run(s) older than {} day(s)",
        deleted, config.pipeline.retention_days
    );
    Ok(())
}
