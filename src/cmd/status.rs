//! Pipeline status command: `placescout status`.

use anyhow::Result;

use placescout::config::ServiceConfig;
use placescout::db::DbHandle;
use placescout::pipeline::RunQueryService;
use placescout::server::open_database;

pub async fn cmd_status(config: &ServiceConfig) -> Result<()> {
    let db = DbHandle::new(open_database(&config.database)?);
    let view = RunQueryService::new(db, &config.pipeline).status().await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
