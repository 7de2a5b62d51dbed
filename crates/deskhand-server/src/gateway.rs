use std::time::Duration;

use deskhand_config::Config;
use deskhand_contracts::{GatewayCommand, GatewayResult};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway transport failure: {0}")]
    Transport(String),
    #[error("gateway rejected {op}: {message}")]
    Rejected { op: String, message: String },
}

/// Client for the chat platform bridge. In `simulated` mode every command
/// succeeds locally and returns deterministic refs, which is what the test
/// suite and local development run against. In `webhook` mode each command
/// is POSTed to the bridge endpoint with bounded retries.
pub struct GatewayClient {
    mode: String,
    endpoint: Option<String>,
    retry_max_attempts: usize,
    retry_backoff: Duration,
    bot_account_id: String,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.gateway.timeout_ms as u64))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            mode: cfg.gateway.mode.clone(),
            endpoint: cfg.gateway.endpoint.clone(),
            retry_max_attempts: cfg.gateway.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.gateway.retry_backoff_ms),
            bot_account_id: cfg.gateway.bot_account_id.clone(),
            client,
        })
    }

    pub fn bot_account_id(&self) -> &str {
        &self.bot_account_id
    }

    /// Creates a ticket channel visible to the given subjects (account ids
    /// and role refs). Returns the new channel ref.
    pub async fn create_channel(
        &self,
        tenant_id: &str,
        name: &str,
        category_ref: &str,
        allow_subjects: &[String],
    ) -> Result<String, GatewayError> {
        if self.mode == "simulated" {
            return Ok(format!("sim-channel-{name}"));
        }
        let result = self
            .dispatch(
                tenant_id,
                "create_channel",
                json!({
                    "name": name,
                    "category_ref": category_ref,
                    "allow_subjects": allow_subjects,
                }),
            )
            .await?;
        result.resource_ref.ok_or_else(|| GatewayError::Rejected {
            op: "create_channel".to_string(),
            message: "bridge returned no channel ref".to_string(),
        })
    }

    pub async fn delete_channel(
        &self,
        tenant_id: &str,
        channel_ref: &str,
    ) -> Result<(), GatewayError> {
        if self.mode == "simulated" {
            return Ok(());
        }
        self.dispatch(
            tenant_id,
            "delete_channel",
            json!({ "channel_ref": channel_ref }),
        )
        .await?;
        Ok(())
    }

    pub async fn edit_channel_permissions(
        &self,
        tenant_id: &str,
        channel_ref: &str,
        subject_ref: &str,
        allow: bool,
    ) -> Result<(), GatewayError> {
        if self.mode == "simulated" {
            return Ok(());
        }
        self.dispatch(
            tenant_id,
            "edit_channel_permissions",
            json!({
                "channel_ref": channel_ref,
                "subject_ref": subject_ref,
                "allow": allow,
            }),
        )
        .await?;
        Ok(())
    }

    /// Posts a message under the service's own account. Returns the message
    /// ref assigned by the platform.
    pub async fn send_as_system(
        &self,
        tenant_id: &str,
        channel_ref: &str,
        content: &str,
    ) -> Result<String, GatewayError> {
        if self.mode == "simulated" {
            return Ok(sim_message_ref());
        }
        let result = self
            .dispatch(
                tenant_id,
                "send_as_system",
                json!({
                    "channel_ref": channel_ref,
                    "content": content,
                }),
            )
            .await?;
        result.resource_ref.ok_or_else(|| GatewayError::Rejected {
            op: "send_as_system".to_string(),
            message: "bridge returned no message ref".to_string(),
        })
    }

    /// Posts a message styled with the given display name and avatar, used
    /// for mirroring console replies into the ticket channel.
    pub async fn send_as_identity(
        &self,
        tenant_id: &str,
        channel_ref: &str,
        display_name: &str,
        avatar_url: Option<&str>,
        content: &str,
    ) -> Result<String, GatewayError> {
        if self.mode == "simulated" {
            return Ok(sim_message_ref());
        }
        let result = self
            .dispatch(
                tenant_id,
                "send_as_identity",
                json!({
                    "channel_ref": channel_ref,
                    "display_name": display_name,
                    "avatar_url": avatar_url,
                    "content": content,
                }),
            )
            .await?;
        result.resource_ref.ok_or_else(|| GatewayError::Rejected {
            op: "send_as_identity".to_string(),
            message: "bridge returned no message ref".to_string(),
        })
    }

    pub async fn resolve_channel(
        &self,
        tenant_id: &str,
        channel_ref: &str,
    ) -> Result<bool, GatewayError> {
        self.resolve(tenant_id, "resolve_channel", "ref", channel_ref)
            .await
    }

    pub async fn resolve_category(
        &self,
        tenant_id: &str,
        category_ref: &str,
    ) -> Result<bool, GatewayError> {
        self.resolve(tenant_id, "resolve_category", "ref", category_ref)
            .await
    }

    pub async fn resolve_role(
        &self,
        tenant_id: &str,
        role_ref: &str,
    ) -> Result<bool, GatewayError> {
        self.resolve(tenant_id, "resolve_role", "ref", role_ref).await
    }

    async fn resolve(
        &self,
        tenant_id: &str,
        op: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, GatewayError> {
        if self.mode == "simulated" {
            // Refs prefixed "missing-" stand in for platform-side deletions.
            return Ok(!value.is_empty() && !value.starts_with("missing-"));
        }
        let result = self.dispatch(tenant_id, op, json!({ key: value })).await?;
        Ok(result.resource_ref.is_some())
    }

    async fn dispatch(
        &self,
        tenant_id: &str,
        op: &str,
        args: Value,
    ) -> Result<GatewayResult, GatewayError> {
        let endpoint = match &self.endpoint {
            Some(v) if !v.is_empty() => v.clone(),
            _ => {
                return Err(GatewayError::Transport(
                    "gateway endpoint is not configured".to_string(),
                ))
            }
        };
        let command = GatewayCommand {
            op: op.to_string(),
            tenant_id: tenant_id.to_string(),
            args,
        };

        let mut last_failure = "transport error".to_string();
        for attempt in 0..self.retry_max_attempts {
            let response = match self.client.post(&endpoint).json(&command).send().await {
                Ok(v) => v,
                Err(e) => {
                    last_failure = e.to_string();
                    if attempt + 1 < self.retry_max_attempts && self.retry_backoff > Duration::ZERO
                    {
                        sleep(self.retry_backoff).await;
                    }
                    continue;
                }
            };
            if !response.status().is_success() {
                last_failure = format!("bridge returned {}", response.status());
                if attempt + 1 < self.retry_max_attempts && self.retry_backoff > Duration::ZERO {
                    sleep(self.retry_backoff).await;
                }
                continue;
            }

            let result: GatewayResult = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_failure = format!("bridge response parse failed: {e}");
                    if attempt + 1 < self.retry_max_attempts && self.retry_backoff > Duration::ZERO
                    {
                        sleep(self.retry_backoff).await;
                    }
                    continue;
                }
            };
            if !result.ok {
                return Err(GatewayError::Rejected {
                    op: op.to_string(),
                    message: result
                        .error
                        .unwrap_or_else(|| "unspecified bridge error".to_string()),
                });
            }
            return Ok(result);
        }
        Err(GatewayError::Transport(last_failure))
    }
}

fn sim_message_ref() -> String {
    format!("sim-msg-{}", uuid::Uuid::new_v4().as_simple())
}
