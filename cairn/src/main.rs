use std::sync::Arc;

use anyhow::{bail, Result};
use cairn::config::load_config;
use cairn::context::Context;
use cairn::http::run_http_server;
use cairn::meta::HttpMeta;
use cairn::tracing::setup_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    setup_tracing(config.log_level.clone());

    let Some(endpoint) = config.meta_endpoint.clone() else {
        bail!("meta_endpoint must be configured; the node cannot validate roots without it");
    };
    let meta = Arc::new(HttpMeta::new(endpoint)?);

    let context = Context::build(config.clone(), meta).await?;
    context.log_configuration();
    context.spawn_maintenance();

    run_http_server(&config, context.state().clone()).await
}
