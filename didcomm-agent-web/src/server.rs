//! `DIDComm` HTTP server implementation.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use didcomm_agent_node::Agent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::{
    error::{Error, Result},
    handlers::routes,
};

/// Configuration for the agent's HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The host to bind to.
    pub host: String,
    /// The port to bind to.
    pub port: u16,
    /// Path receiving `DIDComm` messages.
    pub path: String,
    /// CORS configuration.
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/didcomm".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Base URL of the server, used for short invitation URLs.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// URL receiving `DIDComm` messages, to advertise as the agent's endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url(), self.path)
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins, `*` allowing any.
    pub allowed_origins: Vec<String>,
    /// Whether to allow credentials.
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: false,
        }
    }
}

impl CorsConfig {
    fn middleware(&self) -> Cors {
        let origins = self.allowed_origins.clone();
        let cors = Cors::default()
            .allowed_origin_fn(move |origin, _| {
                let origin = origin.to_str().unwrap_or("");
                origins.iter().any(|allowed| allowed == "*" || allowed == origin)
            })
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![actix_web::http::header::CONTENT_TYPE]);
        if self.allow_credentials {
            cors.supports_credentials()
        } else {
            cors
        }
    }
}

/// Serves an [`Agent`] over HTTP.
pub struct AgentServer {
    config: ServerConfig,
    agent: Arc<Agent>,
}

impl AgentServer {
    /// Creates a server for `agent`.
    #[must_use]
    pub fn new(config: ServerConfig, agent: Arc<Agent>) -> Self {
        Self { config, agent }
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs the server until it is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the address cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        info!(
            host = self.config.host,
            port = self.config.port,
            path = self.config.path,
            "starting DIDComm server"
        );

        let agent = web::Data::new(self.agent);
        let cors = self.config.cors.clone();
        let routes = routes(self.config.path.clone());

        HttpServer::new(move || {
            App::new()
                .app_data(agent.clone())
                .wrap(cors.middleware())
                .wrap(TracingLogger::default())
                .configure(routes.clone())
        })
        .bind((self.config.host.as_str(), self.config.port))
        .map_err(|e| Error::Internal(format!("Failed to bind server: {e}")))?
        .run()
        .await
        .map_err(|e| Error::Internal(format!("Server error: {e}")))?;

        Ok(())
    }
}
