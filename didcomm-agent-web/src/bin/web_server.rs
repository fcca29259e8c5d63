use anyhow::Context;
use didcomm_agent_core::mock::{InMemoryRegistry, MockAnonCreds, MockPlugin};
use didcomm_agent_node::protocols::connection::CreateInvitationOptions;
use didcomm_agent_node::{Agent, AgentConfig};
use didcomm_agent_web::server::{AgentServer, ServerConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = ServerConfig::default();
    if let Ok(port) = std::env::var("PORT") {
        config.port = port.parse().context("PORT is not a port number")?;
    }

    let agent_config = AgentConfig {
        label: "demo agent".to_string(),
        endpoints: vec![config.endpoint()],
        auto_accept_connections: true,
        ..Default::default()
    };
    let agent = Agent::builder(agent_config, Arc::new(MockPlugin::new()), Arc::new(MockAnonCreds))
        .registry(Arc::new(InMemoryRegistry::new("did:key:")))
        .build()
        .context("building the agent")?;

    let invitation = agent
        .connections()
        .create_invitation(CreateInvitationOptions {
            multi_use: true,
            ..Default::default()
        })
        .await
        .context("creating the demo invitation")?;
    info!(url = %invitation.invitation.short_url(&config.base_url()), "invitation ready");

    AgentServer::new(config, Arc::new(agent)).run().await?;
    Ok(())
}
