use std::time::Duration;

use deskhand_config::Config;
use deskhand_contracts::{ResponderProposal, ResponderRequest};
use deskhand_kernel as kernel;

/// Auto-reply collaborator. `builtin` matches the tenant's knowledge base by
/// word overlap; `webhook` delegates to an external service. A `None` from
/// [`ResponderClient::propose`] means no proposal could be produced and the
/// caller should act as if the responder were disabled.
pub struct ResponderClient {
    mode: String,
    endpoint: Option<String>,
    confidence_threshold: f64,
    capture_knowledge: bool,
    client: reqwest::Client,
}

impl ResponderClient {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.responder.timeout_ms as u64))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            mode: cfg.responder.mode.clone(),
            endpoint: cfg.responder.endpoint.clone(),
            confidence_threshold: cfg.responder.confidence_threshold,
            capture_knowledge: cfg.responder.capture_knowledge,
            client,
        })
    }

    pub fn enabled(&self) -> bool {
        self.mode != "disabled"
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    pub fn capture_knowledge(&self) -> bool {
        self.capture_knowledge
    }

    pub async fn propose(&self, request: &ResponderRequest) -> Option<ResponderProposal> {
        match self.mode.as_str() {
            "builtin" => Some(
                match kernel::match_knowledge(&request.knowledge, &request.content) {
                    Some((entry, score)) => ResponderProposal {
                        reply: entry.answer.clone(),
                        confidence: score,
                        needs_human: false,
                    },
                    None => ResponderProposal {
                        reply: String::new(),
                        confidence: 0.0,
                        needs_human: true,
                    },
                },
            ),
            "webhook" => {
                let endpoint = match &self.endpoint {
                    Some(v) if !v.is_empty() => v,
                    _ => {
                        tracing::warn!("responder endpoint is not configured");
                        return None;
                    }
                };
                let response = match self.client.post(endpoint).json(request).send().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "responder transport failure");
                        return None;
                    }
                };
                if !response.status().is_success() {
                    tracing::warn!(status = %response.status(), "responder returned error");
                    return None;
                }
                match response.json::<ResponderProposal>().await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(error = %e, "responder proposal parse failed");
                        None
                    }
                }
            }
            _ => None,
        }
    }
}
