//! HTTP endpoint handlers.

use actix_web::{get, web, HttpResponse};
use didcomm_agent_node::Agent;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Response body for agent status.
#[derive(Debug, Serialize)]
pub struct AgentStatus {
    /// The agent's label.
    pub label: String,
    /// Endpoints the agent advertises.
    pub endpoints: Vec<String>,
    /// Whether the agent is ready to receive messages.
    pub ready: bool,
}

/// Handles incoming `DIDComm` envelopes.
///
/// The envelope is unpacked before answering, so undecryptable or
/// unauthenticated messages get a 400. Accepted messages are dispatched
/// after the 202 is sent.
///
/// # Errors
///
/// Returns [`Error::Rejected`] if the body is not a message for this agent.
pub async fn receive_message(agent: web::Data<Arc<Agent>>, body: web::Bytes) -> Result<HttpResponse> {
    let packed = std::str::from_utf8(&body).map_err(|e| Error::Rejected(format!("body is not UTF-8: {e}")))?;

    let inbound = agent.unpack(packed).await.map_err(|e| {
        warn!("rejecting inbound message: {e}");
        Error::Rejected(e.to_string())
    })?;
    info!(message_id = inbound.message.id.as_str(), message_type = %inbound.message.typ, "accepted message");

    let agent = agent.get_ref().clone();
    actix_web::rt::spawn(async move {
        let message_id = inbound.message.id.as_str().to_string();
        if let Err(e) = agent.dispatch(inbound).await {
            warn!(message_id = %message_id, "inbound message failed: {e}");
        }
    });

    Ok(HttpResponse::Accepted().finish())
}

/// Serves an invitation by its id, for short invitation URLs.
///
/// # Errors
///
/// Returns [`Error::NotFound`] for unknown, consumed or expired invitations.
#[get("/invitations/{id}")]
pub async fn get_invitation(agent: web::Data<Arc<Agent>>, id: web::Path<String>) -> Result<HttpResponse> {
    let id = id.into_inner();
    debug!(invitation_id = id, "invitation requested");

    let invitation = agent
        .connections()
        .find_invitation(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("invitation {id}")))?;
    Ok(HttpResponse::Ok().json(invitation))
}

/// Returns the agent's status.
///
/// # Errors
///
/// Never fails; the signature matches the other handlers.
#[get("/status")]
pub async fn status(agent: web::Data<Arc<Agent>>) -> Result<HttpResponse> {
    let config = agent.config().await;
    let status = AgentStatus {
        label: config.label,
        ready: !config.endpoints.is_empty(),
        endpoints: config.endpoints,
    };
    Ok(HttpResponse::Ok().json(status))
}

/// Registers the handlers, receiving messages on `path`.
pub fn routes(path: String) -> impl Fn(&mut web::ServiceConfig) + Clone + Send + 'static {
    move |cfg: &mut web::ServiceConfig| {
        cfg.route(&path, web::post().to(receive_message))
            .service(get_invitation)
            .service(status);
    }
}
