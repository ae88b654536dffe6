//! HTTP service command: `placescout serve`.

use anyhow::Result;

use placescout::config::ServiceConfig;

pub async fn cmd_serve(config: ServiceConfig) -> Result<()> {
    placescout::server::start_server(config).await
}
