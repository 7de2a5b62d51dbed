//! HTTP surface and engine for the Deskhand ticket service.
//!
//! Handlers stay thin: each one parses the request shape and delegates to an
//! [`AppState`] method that owns locking, authorization, and audit writes.

mod audit;
mod error;
mod gateway;
mod responder;
mod store;

pub use audit::verify_audit_chain;
pub use error::AppError;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use deskhand_config::Config;
use deskhand_contracts::{
    Account, ActivateTenantRequest, AppendMessageRequest, BillingEvent, CheckoutCompleted,
    ClaimTicketRequest, CreateKnowledgeRequest, CreatePanelRequest, CreateTicketRequest,
    DeleteChannelRequest, GatewayEvent, KnowledgeEntry, Message, MessageSource, Panel,
    RegisterTenantRequest, ResendPanelRequest, ResponderRequest, SubscriptionChanged,
    SubscriptionStatus, Tenant, Ticket, TicketStatus, TicketUserRequest, Transcript,
    TranscriptRequest, UpdatePanelRequest, UpdateTenantRequest, UpdateTicketStatusRequest,
    UpgradeTicketRequest, API_VERSION,
};
use deskhand_kernel as kernel;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::audit::{AuditJsonl, AuditRecord};
use crate::gateway::{GatewayClient, GatewayError};
use crate::responder::ResponderClient;
use crate::store::{MemoryStore, SqliteStore, StoreBackend, TokenOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Author id stamped on synthetic log entries (opening messages, notices).
const SYSTEM_AUTHOR: &str = "system";
/// Author id stamped on replies produced by the auto-responder.
const RESPONDER_AUTHOR: &str = "auto-responder";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed on {addr}: {e}"))?;
    tracing::info!(%addr, "deskhand listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("server error: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received sigterm, shutting down"),
    }
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/meta", get(meta))
        .route("/v1/tenants", post(register_tenant))
        .route("/v1/tenants/{tenant_id}", get(get_tenant).patch(update_tenant))
        .route("/v1/tenants/{tenant_id}/activate", post(activate_tenant))
        .route("/v1/accounts/{account_id}", get(get_account))
        .route("/v1/accounts/{account_id}/tenants", get(list_account_tenants))
        .route(
            "/v1/tenants/{tenant_id}/panels",
            post(create_panel).get(list_panels),
        )
        .route(
            "/v1/tenants/{tenant_id}/panels/{panel_id}",
            patch(update_panel).delete(delete_panel),
        )
        .route(
            "/v1/tenants/{tenant_id}/panels/{panel_id}/resend",
            post(resend_panel),
        )
        .route(
            "/v1/tenants/{tenant_id}/tickets",
            post(create_ticket).get(list_tickets),
        )
        .route("/v1/tickets/{ticket_id}", get(get_ticket).patch(update_ticket))
        .route(
            "/v1/tickets/{ticket_id}/messages",
            post(append_message).get(list_ticket_messages),
        )
        .route("/v1/tickets/{ticket_id}/claim", post(claim_ticket))
        .route("/v1/tickets/{ticket_id}/upgrade", post(upgrade_ticket))
        .route("/v1/tickets/{ticket_id}/add-user", post(add_user))
        .route("/v1/tickets/{ticket_id}/remove-user", post(remove_user))
        .route("/v1/tickets/{ticket_id}/transcript", post(create_transcript))
        .route("/v1/tickets/{ticket_id}/delete-channel", post(delete_channel))
        .route(
            "/v1/tenants/{tenant_id}/knowledge",
            post(create_knowledge).get(list_knowledge),
        )
        .route("/v1/gateway/events", post(gateway_events))
        .route("/v1/billing/webhook", post(billing_webhook))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    store: Arc<Mutex<StoreBackend>>,
    audit: Arc<AuditJsonl>,
    gateway: Arc<GatewayClient>,
    responder: Arc<ResponderClient>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for the sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        Ok(Self {
            gateway: Arc::new(GatewayClient::new(&cfg)?),
            responder: Arc::new(ResponderClient::new(&cfg)?),
            audit: Arc::new(AuditJsonl::new(&cfg.audit.jsonl_path).await?),
            store: Arc::new(Mutex::new(store)),
            cfg,
        })
    }

    // ---- tenants ----

    async fn register_tenant(&self, req: RegisterTenantRequest) -> Result<Tenant, AppError> {
        require_field(&req.tenant_id, "tenant_id")?;
        require_field(&req.name, "name")?;
        require_field(&req.owner_id, "owner_id")?;
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        ensure_account(&mut store, &req.owner_id, None).map_err(AppError::Internal)?;
        let tenant = match store.get_tenant(&req.tenant_id) {
            // Re-registration refreshes platform metadata, nothing else.
            Some(mut existing) => {
                existing.name = req.name;
                existing.icon_url = req.icon_url;
                existing.owner_id = req.owner_id;
                existing
            }
            None => Tenant {
                tenant_id: req.tenant_id,
                name: req.name,
                icon_url: req.icon_url,
                owner_id: req.owner_id,
                claim_holder_id: None,
                subscription_status: SubscriptionStatus::None,
                subscription_ref: None,
                manager_role_ref: None,
                anonymous_mode: false,
                identity_name: None,
                identity_avatar_url: None,
            },
        };
        store.put_tenant(&tenant).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(AuditRecord::new(
                &tenant.tenant_id,
                &correlation_id,
                "register_tenant",
                "ok",
            ))
            .await;
        Ok(tenant)
    }

    async fn tenant_view(&self, tenant_id: &str, actor_id: &str) -> Result<Tenant, AppError> {
        let store = self.store.lock().await;
        let tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if !kernel::can_manage_tenant(actor_id, &tenant) {
            return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
        }
        Ok(tenant)
    }

    async fn update_tenant(
        &self,
        tenant_id: &str,
        req: UpdateTenantRequest,
    ) -> Result<Tenant, AppError> {
        let correlation_id = new_correlation();
        {
            let store = self.store.lock().await;
            let tenant = store
                .get_tenant(tenant_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
            if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
                return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
            }
        }

        if let Some(role_ref) = &req.manager_role_ref {
            match self.gateway.resolve_role(tenant_id, role_ref).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(AppError::validation(format!(
                        "manager role does not resolve: {role_ref}"
                    )))
                }
                Err(e) => return Err(map_gateway_error(tenant_id, "resolve_role", e)),
            }
        }

        let mut store = self.store.lock().await;
        let mut tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if let Some(name) = req.name {
            tenant.name = name;
        }
        if let Some(icon_url) = req.icon_url {
            tenant.icon_url = Some(icon_url);
        }
        if let Some(role_ref) = req.manager_role_ref {
            tenant.manager_role_ref = Some(role_ref);
        }
        if let Some(anonymous_mode) = req.anonymous_mode {
            tenant.anonymous_mode = anonymous_mode;
        }
        if let Some(identity_name) = req.identity_name {
            tenant.identity_name = Some(identity_name);
        }
        if let Some(identity_avatar_url) = req.identity_avatar_url {
            tenant.identity_avatar_url = Some(identity_avatar_url);
        }
        store.put_tenant(&tenant).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(AuditRecord::new(
                tenant_id,
                &correlation_id,
                "update_tenant",
                "ok",
            ))
            .await;
        Ok(tenant)
    }

    /// Spends one token from the actor's balance to turn the tenant active
    /// and make the actor its claim holder.
    async fn activate_tenant(
        &self,
        tenant_id: &str,
        req: ActivateTenantRequest,
    ) -> Result<Tenant, AppError> {
        require_field(&req.actor_id, "actor_id")?;
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        let mut tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if tenant.subscription_status == SubscriptionStatus::Active {
            return Err(AppError::conflict("tenant is already active"));
        }
        ensure_account(&mut store, &req.actor_id, None).map_err(AppError::Internal)?;
        match store
            .adjust_tokens(&req.actor_id, -1)
            .map_err(AppError::Internal)?
        {
            TokenOutcome::Applied(_) => {}
            TokenOutcome::InsufficientTokens => {
                let available = store
                    .get_account(&req.actor_id)
                    .map(|a| a.tokens)
                    .unwrap_or(0);
                return Err(AppError::conflict_with(
                    "insufficient token balance",
                    json!({ "required": 1, "available": available }),
                ));
            }
        }
        tenant.subscription_status = SubscriptionStatus::Active;
        tenant.claim_holder_id = Some(req.actor_id.clone());
        store.put_tenant(&tenant).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(tenant_id, &correlation_id, "activate_tenant", "ok")
                    .with_subject(req.actor_id),
            )
            .await;
        Ok(tenant)
    }

    // ---- accounts ----

    async fn account_view(&self, account_id: &str, actor_id: &str) -> Result<Account, AppError> {
        // Balances are visible to their owner only.
        if actor_id != account_id {
            return Err(AppError::Forbidden("not authorized for this account".to_string()));
        }
        let store = self.store.lock().await;
        store
            .get_account(account_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown account: {account_id}")))
    }

    async fn account_tenants_view(
        &self,
        account_id: &str,
        actor_id: &str,
    ) -> Result<Vec<Tenant>, AppError> {
        if actor_id != account_id {
            return Err(AppError::Forbidden("not authorized for this account".to_string()));
        }
        let store = self.store.lock().await;
        Ok(store.list_tenants_for_account(account_id))
    }

    // ---- panels ----

    async fn create_panel(
        &self,
        tenant_id: &str,
        req: CreatePanelRequest,
    ) -> Result<Panel, AppError> {
        let correlation_id = new_correlation();
        {
            let store = self.store.lock().await;
            let tenant = store
                .get_tenant(tenant_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
            if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
                return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
            }
        }
        require_field(&req.title, "title")?;
        kernel::validate_prefix(&req.prefix).map_err(AppError::validation)?;
        kernel::validate_form_fields(&req.form_fields).map_err(AppError::validation)?;

        // Routing refs must resolve on the platform before anything persists.
        self.resolve_routing(
            tenant_id,
            Some(&req.channel_ref),
            Some(&req.category_ref),
            &req.support_role_refs,
        )
        .await?;

        let panel = Panel {
            panel_id: new_id("pnl"),
            tenant_id: tenant_id.to_string(),
            title: req.title,
            channel_ref: req.channel_ref,
            category_ref: req.category_ref,
            support_role_refs: req.support_role_refs,
            transcript_channel_ref: req.transcript_channel_ref,
            prefix: req.prefix,
            form_fields: req.form_fields,
            deleted: false,
        };
        {
            let mut store = self.store.lock().await;
            store.put_panel(&panel).map_err(AppError::Internal)?;
        }

        self.audit
            .append(
                AuditRecord::new(tenant_id, &correlation_id, "create_panel", "ok")
                    .with_subject(panel.panel_id.as_str()),
            )
            .await;
        self.announce_panel(tenant_id, &panel, &correlation_id).await;
        Ok(panel)
    }

    async fn panels_view(&self, tenant_id: &str, actor_id: &str) -> Result<Vec<Panel>, AppError> {
        let store = self.store.lock().await;
        let tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if !kernel::can_manage_tenant(actor_id, &tenant) {
            return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
        }
        Ok(store.list_panels(tenant_id))
    }

    async fn update_panel(
        &self,
        tenant_id: &str,
        panel_id: &str,
        req: UpdatePanelRequest,
    ) -> Result<Panel, AppError> {
        let correlation_id = new_correlation();
        {
            let store = self.store.lock().await;
            let tenant = store
                .get_tenant(tenant_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
            if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
                return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
            }
            store
                .get_panel(panel_id)
                .filter(|p| p.tenant_id == tenant_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown panel: {panel_id}")))?;
        }
        if let Some(prefix) = &req.prefix {
            kernel::validate_prefix(prefix).map_err(AppError::validation)?;
        }
        if let Some(fields) = &req.form_fields {
            kernel::validate_form_fields(fields).map_err(AppError::validation)?;
        }

        self.resolve_routing(
            tenant_id,
            req.channel_ref.as_deref(),
            req.category_ref.as_deref(),
            req.support_role_refs.as_deref().unwrap_or(&[]),
        )
        .await?;

        let mut store = self.store.lock().await;
        let mut panel = store
            .get_panel(panel_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown panel: {panel_id}")))?;
        if panel.deleted {
            return Err(AppError::conflict("panel has been deleted"));
        }
        let mut routing_changed = false;
        if let Some(title) = req.title {
            panel.title = title;
        }
        if let Some(channel_ref) = req.channel_ref {
            routing_changed |= channel_ref != panel.channel_ref;
            panel.channel_ref = channel_ref;
        }
        if let Some(category_ref) = req.category_ref {
            routing_changed |= category_ref != panel.category_ref;
            panel.category_ref = category_ref;
        }
        if let Some(support_role_refs) = req.support_role_refs {
            routing_changed |= support_role_refs != panel.support_role_refs;
            panel.support_role_refs = support_role_refs;
        }
        if let Some(transcript_channel_ref) = req.transcript_channel_ref {
            panel.transcript_channel_ref = Some(transcript_channel_ref);
        }
        if let Some(prefix) = req.prefix {
            panel.prefix = prefix;
        }
        if let Some(form_fields) = req.form_fields {
            panel.form_fields = form_fields;
        }
        store.put_panel(&panel).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(tenant_id, &correlation_id, "update_panel", "ok")
                    .with_subject(panel_id),
            )
            .await;
        // A routing change invalidates the posted announcement, so reissue it.
        if routing_changed {
            self.announce_panel(tenant_id, &panel, &correlation_id).await;
        }
        Ok(panel)
    }

    /// Soft delete. The panel stops listing and stops accepting tickets, but
    /// existing tickets keep their routing snapshot.
    async fn delete_panel(
        &self,
        tenant_id: &str,
        panel_id: &str,
        actor_id: &str,
    ) -> Result<(), AppError> {
        let correlation_id = new_correlation();
        let mut store = self.store.lock().await;
        let tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if !kernel::can_manage_tenant(actor_id, &tenant) {
            return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
        }
        let mut panel = store
            .get_panel(panel_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown panel: {panel_id}")))?;
        panel.deleted = true;
        store.put_panel(&panel).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(tenant_id, &correlation_id, "delete_panel", "ok")
                    .with_subject(panel_id),
            )
            .await;
        Ok(())
    }

    async fn resend_panel(
        &self,
        tenant_id: &str,
        panel_id: &str,
        req: ResendPanelRequest,
    ) -> Result<Value, AppError> {
        let correlation_id = new_correlation();
        let panel = {
            let store = self.store.lock().await;
            let tenant = store
                .get_tenant(tenant_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
            if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
                return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
            }
            if tenant.subscription_status != SubscriptionStatus::Active {
                return Err(AppError::validation_with(
                    "subscription required: tenant is not active",
                    json!({ "reason": "subscription_required" }),
                ));
            }
            let panel = store
                .get_panel(panel_id)
                .filter(|p| p.tenant_id == tenant_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown panel: {panel_id}")))?;
            if panel.deleted {
                return Err(AppError::validation("panel has been deleted"));
            }
            panel
        };

        let content = kernel::panel_announcement(&panel.title, &panel.prefix);
        let message_ref = self
            .gateway
            .send_as_system(tenant_id, &panel.channel_ref, &content)
            .await
            .map_err(|e| map_gateway_error(tenant_id, "send_as_system", e))?;

        self.audit
            .append(
                AuditRecord::new(tenant_id, &correlation_id, "resend_panel", "ok")
                    .with_subject(message_ref.as_str()),
            )
            .await;
        Ok(json!({ "panel_id": panel.panel_id, "message_ref": message_ref }))
    }

    // ---- tickets ----

    /// Persist-first ticket creation. The ticket and its opening message are
    /// durable before any gateway traffic; channel binding is best effort.
    async fn create_ticket(
        &self,
        tenant_id: &str,
        req: CreateTicketRequest,
    ) -> Result<Ticket, AppError> {
        require_field(&req.creator_id, "creator_id")?;
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        let tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if tenant.subscription_status != SubscriptionStatus::Active {
            // Inactive tenants produce no gateway traffic at all.
            return Err(AppError::validation_with(
                "subscription required: tenant is not active",
                json!({ "reason": "subscription_required" }),
            ));
        }
        let panel = store
            .get_panel(&req.panel_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown panel: {}", req.panel_id)))?;
        if panel.deleted {
            return Err(AppError::validation("panel has been deleted"));
        }
        kernel::validate_form_answers(&panel.form_fields, &req.form_answers)
            .map_err(AppError::validation)?;

        let cap = self.cfg.limits.max_open_per_creator;
        if cap > 0 && store.count_open_tickets_for_creator(tenant_id, &req.creator_id) >= cap {
            return Err(AppError::validation_with(
                "open ticket limit reached",
                json!({ "limit": cap }),
            ));
        }

        ensure_account(&mut store, &req.creator_id, req.creator_name.as_deref())
            .map_err(AppError::Internal)?;

        let number = store
            .next_ticket_number(tenant_id, &panel.prefix)
            .map_err(AppError::Internal)?;
        let handle = kernel::ticket_handle(&panel.prefix, number);
        let now = now_ts();
        let mut ticket = Ticket {
            ticket_id: new_id("tkt"),
            tenant_id: tenant_id.to_string(),
            panel_id: panel.panel_id.clone(),
            number,
            prefix: panel.prefix.clone(),
            handle: handle.clone(),
            status: TicketStatus::Open,
            creator_id: req.creator_id.clone(),
            claimant_id: None,
            channel_ref: None,
            support_role_refs: panel.support_role_refs.clone(),
            participants: Vec::new(),
            transcript_channel_ref: panel.transcript_channel_ref.clone(),
            created_at: now.clone(),
            closed_at: None,
            closed_by: None,
            channel_deleted_at: None,
        };
        store.put_ticket(&ticket).map_err(AppError::Internal)?;

        // Opening message is always seq 1, with or without a channel.
        let opening = kernel::opening_message(
            &handle,
            &req.creator_id,
            &ticket.support_role_refs,
            &panel.form_fields,
            &req.form_answers,
        );
        let seq = store
            .next_message_seq(&ticket.ticket_id)
            .map_err(AppError::Internal)?;
        let message = Message {
            ticket_id: ticket.ticket_id.clone(),
            seq,
            author_id: SYSTEM_AUTHOR.to_string(),
            author_name: "Deskhand".to_string(),
            author_avatar_url: None,
            content: opening.clone(),
            source: MessageSource::OperatorConsole,
            attachments: Vec::new(),
            from_support: false,
            created_at: now,
        };
        store.put_message(&message).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(tenant_id, &correlation_id, "create_ticket", "ok")
                    .with_subject(handle.as_str()),
            )
            .await;

        let channel_name = kernel::channel_name(&ticket.prefix, number);
        let mut allow_subjects = vec![req.creator_id.clone()];
        allow_subjects.extend(ticket.support_role_refs.iter().cloned());
        match self
            .gateway
            .create_channel(tenant_id, &channel_name, &panel.category_ref, &allow_subjects)
            .await
        {
            Ok(channel_ref) => {
                self.audit
                    .append(
                        AuditRecord::new(tenant_id, &correlation_id, "create_channel", "ok")
                            .with_subject(channel_ref.as_str()),
                    )
                    .await;
                if let Err(e) = self
                    .gateway
                    .send_as_system(tenant_id, &channel_ref, &opening)
                    .await
                {
                    tracing::warn!(
                        tenant_id,
                        ticket_id = %ticket.ticket_id,
                        error = %e,
                        "opening message post failed"
                    );
                }
                let mut store = self.store.lock().await;
                if let Some(mut fresh) = store.get_ticket(&ticket.ticket_id) {
                    fresh.channel_ref = Some(channel_ref);
                    store.put_ticket(&fresh).map_err(AppError::Internal)?;
                    ticket = fresh;
                }
            }
            Err(e) => {
                // The ticket stays channel-less and remains fully usable
                // from the console.
                tracing::warn!(
                    tenant_id,
                    ticket_id = %ticket.ticket_id,
                    error = %e,
                    "channel creation failed"
                );
                self.audit
                    .append(
                        AuditRecord::new(tenant_id, &correlation_id, "create_channel", "failed")
                            .with_subject(handle.as_str()),
                    )
                    .await;
            }
        }
        Ok(ticket)
    }

    async fn tickets_view(
        &self,
        tenant_id: &str,
        actor_id: &str,
        status: Option<TicketStatus>,
        panel_id: Option<&str>,
    ) -> Result<Vec<Ticket>, AppError> {
        let store = self.store.lock().await;
        let tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if !kernel::can_manage_tenant(actor_id, &tenant) {
            return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
        }
        Ok(store.list_tickets(tenant_id, status, panel_id))
    }

    async fn ticket_view(&self, ticket_id: &str, actor_id: &str) -> Result<Ticket, AppError> {
        let store = self.store.lock().await;
        let ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        let tenant = store
            .get_tenant(&ticket.tenant_id)
            .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
        if !kernel::can_view_ticket(actor_id, &tenant, &ticket) {
            return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
        }
        Ok(ticket)
    }

    async fn messages_view(
        &self,
        ticket_id: &str,
        actor_id: &str,
        after_seq: i64,
    ) -> Result<Vec<Message>, AppError> {
        let store = self.store.lock().await;
        let ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        let tenant = store
            .get_tenant(&ticket.tenant_id)
            .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
        if !kernel::can_view_ticket(actor_id, &tenant, &ticket) {
            return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
        }
        Ok(store.list_messages(ticket_id, after_seq))
    }

    /// Console-origin append. Assigns the next seq under the store lock and
    /// mirrors into the bound channel afterwards.
    async fn append_console_message(
        &self,
        ticket_id: &str,
        req: AppendMessageRequest,
    ) -> Result<Message, AppError> {
        require_field(&req.author_id, "author_id")?;
        if req.content.trim().is_empty() && req.attachments.is_empty() {
            return Err(AppError::validation("content or attachments required"));
        }
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        let ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        let tenant = store
            .get_tenant(&ticket.tenant_id)
            .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
        if !kernel::can_append_message(&req.author_id, &tenant, &ticket) {
            return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
        }
        let seq = store
            .next_message_seq(ticket_id)
            .map_err(AppError::Internal)?;
        let message = Message {
            ticket_id: ticket_id.to_string(),
            seq,
            author_id: req.author_id.clone(),
            author_name: req.author_name.unwrap_or_else(|| req.author_id.clone()),
            author_avatar_url: req.author_avatar_url,
            content: req.content,
            source: MessageSource::OperatorConsole,
            attachments: req.attachments,
            from_support: kernel::is_support_author(&req.author_id, ticket.claimant_id.as_deref()),
            created_at: now_ts(),
        };
        store.put_message(&message).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(&ticket.tenant_id, &correlation_id, "append_message", "ok")
                    .with_subject(format!("seq:{seq}")),
            )
            .await;
        self.mirror_message(&tenant, &ticket, &message, &correlation_id)
            .await;
        Ok(message)
    }

    /// Claim toggle. Unclaimed claims, holder releases, anyone else gets a
    /// conflict naming the holder.
    async fn claim_ticket(&self, ticket_id: &str, req: ClaimTicketRequest) -> Result<Ticket, AppError> {
        require_field(&req.actor_id, "actor_id")?;
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        let ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        let decision =
            kernel::evaluate_claim(ticket.claimant_id.as_deref(), &req.actor_id, &ticket.creator_id);
        let (expected, next, result) = match decision {
            kernel::ClaimDecision::SelfClaim => {
                return Err(AppError::Forbidden(
                    "ticket creator cannot claim their own ticket".to_string(),
                ));
            }
            kernel::ClaimDecision::HeldByOther { holder } => {
                return Err(AppError::conflict_with(
                    "ticket is already claimed",
                    json!({ "holder": holder }),
                ));
            }
            kernel::ClaimDecision::Claimed => (None, Some(req.actor_id.as_str()), "claimed"),
            kernel::ClaimDecision::Released => (Some(req.actor_id.as_str()), None, "released"),
        };
        let landed = store
            .set_claimant(ticket_id, expected, next)
            .map_err(AppError::Internal)?;
        if !landed {
            let holder = store
                .get_ticket(ticket_id)
                .and_then(|t| t.claimant_id)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(AppError::conflict_with(
                "ticket is already claimed",
                json!({ "holder": holder }),
            ));
        }
        let ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::Internal("ticket vanished during claim".to_string()))?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(&ticket.tenant_id, &correlation_id, "claim_ticket", result)
                    .with_subject(req.actor_id.as_str()),
            )
            .await;
        let notice = match result {
            "claimed" => format!("Ticket claimed by <@{}>.", req.actor_id),
            _ => format!("Claim released by <@{}>.", req.actor_id),
        };
        self.post_notice(&ticket.tenant_id, &ticket, &notice).await;
        Ok(ticket)
    }

    async fn set_ticket_status(
        &self,
        ticket_id: &str,
        req: UpdateTicketStatusRequest,
    ) -> Result<Ticket, AppError> {
        require_field(&req.actor_id, "actor_id")?;
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        let mut ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        let tenant = store
            .get_tenant(&ticket.tenant_id)
            .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
        if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
            return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
        }
        let decision = kernel::evaluate_status_change(ticket.status, req.status);
        let result = match decision {
            kernel::StatusDecision::Unchanged => {
                return Err(AppError::conflict(format!(
                    "ticket is already {}",
                    status_label(ticket.status)
                )));
            }
            kernel::StatusDecision::Close => {
                ticket.status = TicketStatus::Closed;
                ticket.closed_at = Some(now_ts());
                ticket.closed_by = Some(req.actor_id.clone());
                "closed"
            }
            kernel::StatusDecision::Reopen => {
                ticket.status = TicketStatus::Open;
                ticket.closed_at = None;
                ticket.closed_by = None;
                "reopened"
            }
        };
        store.put_ticket(&ticket).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(&ticket.tenant_id, &correlation_id, "set_status", result)
                    .with_subject(req.actor_id.as_str()),
            )
            .await;

        match decision {
            kernel::StatusDecision::Close => {
                // Closing hides the channel from the creator but keeps it
                // around for support until an explicit delete.
                self.set_channel_visibility(
                    &ticket.tenant_id,
                    &ticket,
                    &ticket.creator_id,
                    false,
                    &correlation_id,
                )
                .await;
                self.post_notice(
                    &ticket.tenant_id,
                    &ticket,
                    &format!(
                        "Ticket closed by <@{}>. Generate a transcript or delete the channel from the console.",
                        req.actor_id
                    ),
                )
                .await;
            }
            kernel::StatusDecision::Reopen => {
                self.set_channel_visibility(
                    &ticket.tenant_id,
                    &ticket,
                    &ticket.creator_id,
                    true,
                    &correlation_id,
                )
                .await;
                self.post_notice(
                    &ticket.tenant_id,
                    &ticket,
                    &format!("Ticket reopened by <@{}>.", req.actor_id),
                )
                .await;
            }
            kernel::StatusDecision::Unchanged => {}
        }
        Ok(ticket)
    }

    /// Escalation: widen the ticket's support role set and the origin
    /// panel's, then grant the role visibility on the live channel.
    async fn upgrade_ticket(
        &self,
        ticket_id: &str,
        req: UpgradeTicketRequest,
    ) -> Result<Ticket, AppError> {
        require_field(&req.role_ref, "role_ref")?;
        let correlation_id = new_correlation();

        let tenant_id = {
            let store = self.store.lock().await;
            let ticket = store
                .get_ticket(ticket_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
            let tenant = store
                .get_tenant(&ticket.tenant_id)
                .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
            if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
                return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
            }
            ticket.tenant_id
        };

        match self.gateway.resolve_role(&tenant_id, &req.role_ref).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(AppError::validation(format!(
                    "role does not resolve: {}",
                    req.role_ref
                )))
            }
            Err(e) => return Err(map_gateway_error(&tenant_id, "resolve_role", e)),
        }

        let mut store = self.store.lock().await;
        let mut ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        let already = ticket.support_role_refs.iter().any(|r| r == &req.role_ref);
        if !already {
            ticket.support_role_refs.push(req.role_ref.clone());
            store.put_ticket(&ticket).map_err(AppError::Internal)?;
            if let Some(mut panel) = store.get_panel(&ticket.panel_id) {
                // A soft-deleted panel keeps its routing frozen.
                if !panel.deleted && !panel.support_role_refs.iter().any(|r| r == &req.role_ref) {
                    panel.support_role_refs.push(req.role_ref.clone());
                    store.put_panel(&panel).map_err(AppError::Internal)?;
                }
            }
        }
        drop(store);

        let result = if already { "noop" } else { "ok" };
        self.audit
            .append(
                AuditRecord::new(&tenant_id, &correlation_id, "escalate_ticket", result)
                    .with_subject(req.role_ref.as_str()),
            )
            .await;
        if !already {
            self.set_channel_visibility(&tenant_id, &ticket, &req.role_ref, true, &correlation_id)
                .await;
        }
        Ok(ticket)
    }

    async fn set_participant(
        &self,
        ticket_id: &str,
        req: TicketUserRequest,
        add: bool,
    ) -> Result<Ticket, AppError> {
        require_field(&req.user_id, "user_id")?;
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        let mut ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        let tenant = store
            .get_tenant(&ticket.tenant_id)
            .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
        if !kernel::can_manage_participants(&req.actor_id, &tenant, &ticket) {
            return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
        }
        let present = ticket.participants.iter().any(|p| p == &req.user_id);
        let changed = if add && !present {
            ticket.participants.push(req.user_id.clone());
            true
        } else if !add && present {
            ticket.participants.retain(|p| p != &req.user_id);
            true
        } else {
            false
        };
        if changed {
            store.put_ticket(&ticket).map_err(AppError::Internal)?;
        }
        drop(store);

        let action = if add { "add_participant" } else { "remove_participant" };
        let result = if changed { "ok" } else { "noop" };
        self.audit
            .append(
                AuditRecord::new(&ticket.tenant_id, &correlation_id, action, result)
                    .with_subject(req.user_id.as_str()),
            )
            .await;
        if changed {
            self.set_channel_visibility(
                &ticket.tenant_id,
                &ticket,
                &req.user_id,
                add,
                &correlation_id,
            )
            .await;
        }
        Ok(ticket)
    }

    /// Renders the full message log and delivers it to the configured
    /// transcript channel. Ticket state is not touched.
    async fn generate_transcript(
        &self,
        ticket_id: &str,
        req: TranscriptRequest,
    ) -> Result<Transcript, AppError> {
        let correlation_id = new_correlation();
        let (ticket, destination, messages) = {
            let store = self.store.lock().await;
            let ticket = store
                .get_ticket(ticket_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
            let tenant = store
                .get_tenant(&ticket.tenant_id)
                .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
            if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
                return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
            }
            let destination = ticket
                .transcript_channel_ref
                .clone()
                .or_else(|| store.get_panel(&ticket.panel_id).and_then(|p| p.transcript_channel_ref))
                .ok_or_else(|| AppError::validation("no transcript destination configured"))?;
            let messages = store.list_messages(ticket_id, 0);
            (ticket, destination, messages)
        };

        let body = kernel::render_transcript(&messages);
        let content = format!("Transcript for {}\n{body}", ticket.handle);
        self.gateway
            .send_as_system(&ticket.tenant_id, &destination, &content)
            .await
            .map_err(|e| map_gateway_error(&ticket.tenant_id, "send_as_system", e))?;

        self.audit
            .append(
                AuditRecord::new(&ticket.tenant_id, &correlation_id, "transcript", "ok")
                    .with_subject(destination.as_str()),
            )
            .await;
        Ok(Transcript {
            ticket_id: ticket.ticket_id,
            handle: ticket.handle,
            destination_ref: destination,
            line_count: messages.len(),
            body,
        })
    }

    /// Tears down the platform channel. The message log survives; only the
    /// binding and the channel itself go away.
    async fn delete_ticket_channel(
        &self,
        ticket_id: &str,
        req: DeleteChannelRequest,
    ) -> Result<Ticket, AppError> {
        let correlation_id = new_correlation();
        let (tenant_id, channel_ref) = {
            let store = self.store.lock().await;
            let ticket = store
                .get_ticket(ticket_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
            let tenant = store
                .get_tenant(&ticket.tenant_id)
                .ok_or_else(|| AppError::Internal(format!("ticket {ticket_id} has no tenant")))?;
            if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
                return Err(AppError::Forbidden("not authorized for this ticket".to_string()));
            }
            let channel_ref = ticket
                .channel_ref
                .clone()
                .ok_or_else(|| AppError::validation("ticket has no channel"))?;
            (ticket.tenant_id, channel_ref)
        };

        self.gateway
            .delete_channel(&tenant_id, &channel_ref)
            .await
            .map_err(|e| map_gateway_error(&tenant_id, "delete_channel", e))?;

        let mut store = self.store.lock().await;
        let mut ticket = store
            .get_ticket(ticket_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown ticket: {ticket_id}")))?;
        ticket.channel_ref = None;
        ticket.channel_deleted_at = Some(now_ts());
        store.put_ticket(&ticket).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(&tenant_id, &correlation_id, "delete_channel", "ok")
                    .with_subject(channel_ref.as_str()),
            )
            .await;
        Ok(ticket)
    }

    // ---- knowledge ----

    async fn knowledge_view(
        &self,
        tenant_id: &str,
        actor_id: &str,
    ) -> Result<Vec<KnowledgeEntry>, AppError> {
        let store = self.store.lock().await;
        let tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if !kernel::can_manage_tenant(actor_id, &tenant) {
            return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
        }
        Ok(store.list_knowledge(tenant_id))
    }

    async fn create_knowledge(
        &self,
        tenant_id: &str,
        req: CreateKnowledgeRequest,
    ) -> Result<KnowledgeEntry, AppError> {
        require_field(&req.trigger, "trigger")?;
        require_field(&req.answer, "answer")?;
        let correlation_id = new_correlation();

        let mut store = self.store.lock().await;
        let tenant = store
            .get_tenant(tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown tenant: {tenant_id}")))?;
        if !kernel::can_manage_tenant(&req.actor_id, &tenant) {
            return Err(AppError::Forbidden("not authorized for this tenant".to_string()));
        }
        if store.knowledge_trigger_exists(tenant_id, &req.trigger) {
            return Err(AppError::conflict(format!(
                "knowledge trigger already exists: {}",
                req.trigger
            )));
        }
        let entry = KnowledgeEntry {
            entry_id: new_id("kb"),
            tenant_id: tenant_id.to_string(),
            trigger: req.trigger,
            answer: req.answer,
            auto_captured: false,
            created_at: now_ts(),
        };
        store.put_knowledge(&entry).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(tenant_id, &correlation_id, "create_knowledge", "ok")
                    .with_subject(entry.entry_id.as_str()),
            )
            .await;
        Ok(entry)
    }

    // ---- gateway ingestion ----

    /// Folds a bridge-observed channel message into the ticket log. Our own
    /// mirrored sends come back through here and are dropped by author id.
    async fn ingest_gateway_event(&self, event: GatewayEvent) -> Result<(), AppError> {
        if event.author_id == self.gateway.bot_account_id() {
            return Ok(());
        }
        require_field(&event.author_id, "author_id")?;
        require_field(&event.channel_ref, "channel_ref")?;
        if kernel::parse_rfc3339(&event.occurred_at).is_none() {
            return Err(AppError::validation("occurred_at must be an RFC3339 timestamp"));
        }
        let correlation_id = event.event_id.clone().unwrap_or_else(new_correlation);

        let mut store = self.store.lock().await;
        let ticket = store.find_ticket_by_channel(&event.channel_ref).ok_or_else(|| {
            AppError::NotFound(format!("no ticket bound to channel: {}", event.channel_ref))
        })?;
        let tenant = store
            .get_tenant(&ticket.tenant_id)
            .ok_or_else(|| AppError::Internal(format!("ticket {} has no tenant", ticket.ticket_id)))?;
        let seq = store
            .next_message_seq(&ticket.ticket_id)
            .map_err(AppError::Internal)?;
        let message = Message {
            ticket_id: ticket.ticket_id.clone(),
            seq,
            author_id: event.author_id.clone(),
            author_name: event
                .author_name
                .clone()
                .unwrap_or_else(|| event.author_id.clone()),
            author_avatar_url: event.author_avatar_url.clone(),
            content: event.content.clone(),
            source: MessageSource::ChatPlatform,
            attachments: event.attachments.clone(),
            from_support: kernel::is_support_author(&event.author_id, ticket.claimant_id.as_deref()),
            created_at: now_ts(),
        };
        store.put_message(&message).map_err(AppError::Internal)?;
        drop(store);

        self.audit
            .append(
                AuditRecord::new(&ticket.tenant_id, &correlation_id, "append_message", "ok")
                    .with_subject(format!("seq:{seq}")),
            )
            .await;

        // The responder only speaks on unclaimed tickets, and only to the
        // person who opened them.
        if self.responder.enabled()
            && ticket.claimant_id.is_none()
            && event.author_id == ticket.creator_id
        {
            self.consult_responder(&tenant, &ticket, &event.content, &correlation_id)
                .await;
        }
        Ok(())
    }

    // ---- billing ----

    async fn process_billing_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Value, AppError> {
        let header = headers
            .get("deskhand-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::InvalidSignature("missing Deskhand-Signature header".to_string())
            })?;
        verify_billing_signature(
            &self.cfg.billing.webhook_secret,
            header,
            body,
            self.cfg.billing.signature_tolerance_secs,
            Utc::now().timestamp(),
        )?;

        let event: BillingEvent = serde_json::from_slice(body)
            .map_err(|e| AppError::validation(format!("invalid billing payload: {e}")))?;
        require_field(&event.event_id, "event_id")?;

        // The replay check and mark_event_processed share one lock scope per
        // arm; a second delivery of the same event id either sees the mark or
        // waits behind the first.
        match event.kind.as_str() {
            "checkout.completed" => {
                let data: CheckoutCompleted = serde_json::from_value(event.data.clone())
                    .map_err(|e| AppError::validation(format!("invalid checkout payload: {e}")))?;
                let mut store = self.store.lock().await;
                if store.event_processed(&event.event_id) {
                    drop(store);
                    return self.acknowledge_duplicate(&event).await;
                }
                let mut tenant = store.get_tenant(&data.tenant_ref).ok_or_else(|| {
                    AppError::NotFound(format!("unknown tenant: {}", data.tenant_ref))
                })?;
                ensure_account(&mut store, &data.account_ref, None).map_err(AppError::Internal)?;
                tenant.subscription_status = SubscriptionStatus::Active;
                tenant.subscription_ref = Some(data.subscription_ref.clone());
                tenant.claim_holder_id = Some(data.account_ref.clone());
                store.put_tenant(&tenant).map_err(AppError::Internal)?;
                let tokens = data
                    .plan
                    .as_deref()
                    .and_then(|plan| self.cfg.billing.plan_tokens.get(plan).copied())
                    .unwrap_or(self.cfg.billing.default_plan_tokens);
                if tokens > 0 {
                    store
                        .adjust_tokens(&data.account_ref, tokens)
                        .map_err(AppError::Internal)?;
                }
                store
                    .mark_event_processed(&event.event_id, &event.kind)
                    .map_err(AppError::Internal)?;
                drop(store);
                self.audit
                    .append(
                        AuditRecord::new(&data.tenant_ref, &event.event_id, "billing_event", "ok")
                            .with_subject(event.kind.as_str()),
                    )
                    .await;
            }
            "subscription.updated" | "subscription.deleted" => {
                let data: SubscriptionChanged =
                    serde_json::from_value(event.data.clone()).map_err(|e| {
                        AppError::validation(format!("invalid subscription payload: {e}"))
                    })?;
                let mut store = self.store.lock().await;
                if store.event_processed(&event.event_id) {
                    drop(store);
                    return self.acknowledge_duplicate(&event).await;
                }
                let mut tenant = store
                    .find_tenant_by_subscription(&data.subscription_ref)
                    .ok_or_else(|| {
                        AppError::NotFound(format!(
                            "unknown subscription: {}",
                            data.subscription_ref
                        ))
                    })?;
                let deactivate = event.kind == "subscription.deleted" || data.status != "active";
                if deactivate {
                    tenant.subscription_status = SubscriptionStatus::Inactive;
                    let former_holder = tenant.claim_holder_id.take();
                    store.put_tenant(&tenant).map_err(AppError::Internal)?;
                    if let Some(holder) = former_holder {
                        // Balance floors at zero; InsufficientTokens is not
                        // an error here.
                        if let Err(e) = store.adjust_tokens(&holder, -1) {
                            tracing::warn!(
                                tenant_id = %tenant.tenant_id,
                                error = %e,
                                "holder token decrement failed"
                            );
                        }
                    }
                } else {
                    tenant.subscription_status = SubscriptionStatus::Active;
                    store.put_tenant(&tenant).map_err(AppError::Internal)?;
                }
                store
                    .mark_event_processed(&event.event_id, &event.kind)
                    .map_err(AppError::Internal)?;
                drop(store);
                self.audit
                    .append(
                        AuditRecord::new(&tenant.tenant_id, &event.event_id, "billing_event", "ok")
                            .with_subject(event.kind.as_str()),
                    )
                    .await;
            }
            other => {
                // Acknowledged but not marked processed, so a later service
                // version can replay it.
                tracing::info!(kind = other, event_id = %event.event_id, "ignoring billing event kind");
                self.audit
                    .append(
                        AuditRecord::new("-", &event.event_id, "billing_event", "ignored")
                            .with_subject(other),
                    )
                    .await;
                return Ok(json!({ "received": true, "ignored": true }));
            }
        }
        Ok(json!({ "received": true }))
    }

    async fn acknowledge_duplicate(&self, event: &BillingEvent) -> Result<Value, AppError> {
        self.audit
            .append(
                AuditRecord::new("-", &event.event_id, "billing_event", "duplicate")
                    .with_subject(event.kind.as_str()),
            )
            .await;
        Ok(json!({ "received": true, "duplicate": true }))
    }

    // ---- gateway side effects ----

    async fn resolve_routing(
        &self,
        tenant_id: &str,
        channel_ref: Option<&str>,
        category_ref: Option<&str>,
        role_refs: &[String],
    ) -> Result<(), AppError> {
        if let Some(channel_ref) = channel_ref {
            match self.gateway.resolve_channel(tenant_id, channel_ref).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(AppError::validation(format!(
                        "channel does not resolve: {channel_ref}"
                    )))
                }
                Err(e) => return Err(map_gateway_error(tenant_id, "resolve_channel", e)),
            }
        }
        if let Some(category_ref) = category_ref {
            match self.gateway.resolve_category(tenant_id, category_ref).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(AppError::validation(format!(
                        "category does not resolve: {category_ref}"
                    )))
                }
                Err(e) => return Err(map_gateway_error(tenant_id, "resolve_category", e)),
            }
        }
        for role_ref in role_refs {
            match self.gateway.resolve_role(tenant_id, role_ref).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(AppError::validation(format!(
                        "support role does not resolve: {role_ref}"
                    )))
                }
                Err(e) => return Err(map_gateway_error(tenant_id, "resolve_role", e)),
            }
        }
        Ok(())
    }

    async fn announce_panel(&self, tenant_id: &str, panel: &Panel, correlation_id: &str) {
        let content = kernel::panel_announcement(&panel.title, &panel.prefix);
        match self
            .gateway
            .send_as_system(tenant_id, &panel.channel_ref, &content)
            .await
        {
            Ok(message_ref) => {
                self.audit
                    .append(
                        AuditRecord::new(tenant_id, correlation_id, "panel_announcement", "ok")
                            .with_subject(message_ref),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id,
                    panel_id = %panel.panel_id,
                    error = %e,
                    "panel announcement failed"
                );
                self.audit
                    .append(AuditRecord::new(
                        tenant_id,
                        correlation_id,
                        "panel_announcement",
                        "failed",
                    ))
                    .await;
            }
        }
    }

    /// Mirrors a console-origin message into the bound channel. Chat-origin
    /// messages came from the channel and are never sent back.
    async fn mirror_message(
        &self,
        tenant: &Tenant,
        ticket: &Ticket,
        message: &Message,
        correlation_id: &str,
    ) {
        if message.source != MessageSource::OperatorConsole {
            return;
        }
        let channel_ref = match &ticket.channel_ref {
            Some(v) => v,
            None => return,
        };
        let (display_name, avatar_url) = if tenant.anonymous_mode {
            (
                tenant
                    .identity_name
                    .clone()
                    .unwrap_or_else(|| "Support".to_string()),
                tenant.identity_avatar_url.clone(),
            )
        } else {
            (message.author_name.clone(), message.author_avatar_url.clone())
        };
        let mut content = message.content.clone();
        for url in &message.attachments {
            content.push('\n');
            content.push_str(url);
        }
        match self
            .gateway
            .send_as_identity(
                &ticket.tenant_id,
                channel_ref,
                &display_name,
                avatar_url.as_deref(),
                &content,
            )
            .await
        {
            Ok(message_ref) => {
                self.audit
                    .append(
                        AuditRecord::new(&ticket.tenant_id, correlation_id, "mirror_message", "ok")
                            .with_subject(message_ref),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id = %ticket.tenant_id,
                    ticket_id = %ticket.ticket_id,
                    error = %e,
                    "mirror failed"
                );
                self.audit
                    .append(AuditRecord::new(
                        &ticket.tenant_id,
                        correlation_id,
                        "mirror_message",
                        "failed",
                    ))
                    .await;
            }
        }
    }

    async fn set_channel_visibility(
        &self,
        tenant_id: &str,
        ticket: &Ticket,
        subject: &str,
        allow: bool,
        correlation_id: &str,
    ) {
        let channel_ref = match &ticket.channel_ref {
            Some(v) => v,
            None => return,
        };
        let action = if allow {
            "grant_visibility"
        } else {
            "revoke_visibility"
        };
        match self
            .gateway
            .edit_channel_permissions(tenant_id, channel_ref, subject, allow)
            .await
        {
            Ok(()) => {
                self.audit
                    .append(
                        AuditRecord::new(tenant_id, correlation_id, action, "ok")
                            .with_subject(subject),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id,
                    ticket_id = %ticket.ticket_id,
                    subject,
                    error = %e,
                    "permission edit failed"
                );
                self.audit
                    .append(
                        AuditRecord::new(tenant_id, correlation_id, action, "failed")
                            .with_subject(subject),
                    )
                    .await;
            }
        }
    }

    async fn post_notice(&self, tenant_id: &str, ticket: &Ticket, content: &str) {
        let channel_ref = match &ticket.channel_ref {
            Some(v) => v,
            None => return,
        };
        if let Err(e) = self.gateway.send_as_system(tenant_id, channel_ref, content).await {
            tracing::warn!(
                tenant_id,
                ticket_id = %ticket.ticket_id,
                error = %e,
                "system notice failed"
            );
        }
    }

    // ---- responder ----

    async fn consult_responder(
        &self,
        tenant: &Tenant,
        ticket: &Ticket,
        content: &str,
        correlation_id: &str,
    ) {
        let (history, knowledge) = {
            let store = self.store.lock().await;
            (
                store.list_messages(&ticket.ticket_id, 0),
                store.list_knowledge(&tenant.tenant_id),
            )
        };
        let request = ResponderRequest {
            tenant_id: tenant.tenant_id.clone(),
            ticket_id: ticket.ticket_id.clone(),
            handle: ticket.handle.clone(),
            content: content.to_string(),
            history,
            knowledge,
        };
        let proposal = match self.responder.propose(&request).await {
            Some(v) => v,
            None => return,
        };

        match kernel::responder_disposition(
            proposal.confidence,
            proposal.needs_human,
            self.responder.confidence_threshold(),
        ) {
            kernel::ResponderDisposition::Confident => {
                let appended = self
                    .append_responder_message(tenant, ticket, &proposal.reply, correlation_id)
                    .await;
                if appended.is_some() && self.responder.capture_knowledge() {
                    let mut store = self.store.lock().await;
                    if !store.knowledge_trigger_exists(&tenant.tenant_id, content) {
                        let entry = KnowledgeEntry {
                            entry_id: new_id("kb"),
                            tenant_id: tenant.tenant_id.clone(),
                            trigger: content.to_string(),
                            answer: proposal.reply.clone(),
                            auto_captured: true,
                            created_at: now_ts(),
                        };
                        if let Err(e) = store.put_knowledge(&entry) {
                            tracing::warn!(
                                tenant_id = %tenant.tenant_id,
                                error = %e,
                                "knowledge capture failed"
                            );
                        }
                    }
                }
            }
            kernel::ResponderDisposition::NeedsHuman => {
                self.append_responder_message(
                    tenant,
                    ticket,
                    "Thanks, a support member will take a look shortly.",
                    correlation_id,
                )
                .await;
                if !ticket.support_role_refs.is_empty() {
                    let mentions: Vec<String> = ticket
                        .support_role_refs
                        .iter()
                        .map(|r| format!("<@&{r}>"))
                        .collect();
                    let notice = format!(
                        "Support attention needed on {}: {}",
                        ticket.handle,
                        mentions.join(" ")
                    );
                    self.post_notice(&tenant.tenant_id, ticket, &notice).await;
                }
            }
        }
    }

    /// Responder replies take the ordinary append path so they mirror and
    /// show up in transcripts like any operator message.
    async fn append_responder_message(
        &self,
        tenant: &Tenant,
        ticket: &Ticket,
        content: &str,
        correlation_id: &str,
    ) -> Option<Message> {
        let mut store = self.store.lock().await;
        let seq = match store.next_message_seq(&ticket.ticket_id) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    ticket_id = %ticket.ticket_id,
                    error = %e,
                    "responder seq assignment failed"
                );
                return None;
            }
        };
        let message = Message {
            ticket_id: ticket.ticket_id.clone(),
            seq,
            author_id: RESPONDER_AUTHOR.to_string(),
            author_name: tenant
                .identity_name
                .clone()
                .unwrap_or_else(|| "Deskhand Assistant".to_string()),
            author_avatar_url: tenant.identity_avatar_url.clone(),
            content: content.to_string(),
            source: MessageSource::OperatorConsole,
            attachments: Vec::new(),
            from_support: false,
            created_at: now_ts(),
        };
        if let Err(e) = store.put_message(&message) {
            tracing::warn!(
                tenant_id = %tenant.tenant_id,
                ticket_id = %ticket.ticket_id,
                error = %e,
                "responder append failed"
            );
            return None;
        }
        drop(store);

        self.audit
            .append(
                AuditRecord::new(&tenant.tenant_id, correlation_id, "responder_reply", "ok")
                    .with_subject(format!("seq:{seq}")),
            )
            .await;
        self.mirror_message(tenant, ticket, &message, correlation_id)
            .await;
        Some(message)
    }
}

// ---- handlers ----

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn meta(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "api_version": API_VERSION,
        "store": state.cfg.store.kind,
        "gateway_mode": state.cfg.gateway.mode,
        "responder_mode": state.cfg.responder.mode,
        "limits": { "max_open_per_creator": state.cfg.limits.max_open_per_creator },
    }))
}

async fn register_tenant(
    State(state): State<AppState>,
    Json(req): Json<RegisterTenantRequest>,
) -> Result<Json<Tenant>, AppError> {
    state.register_tenant(req).await.map(Json)
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Tenant>, AppError> {
    let actor_id = require_actor(&headers)?;
    state.tenant_view(&tenant_id, &actor_id).await.map(Json)
}

async fn update_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<UpdateTenantRequest>,
) -> Result<Json<Tenant>, AppError> {
    state.update_tenant(&tenant_id, req).await.map(Json)
}

async fn activate_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<ActivateTenantRequest>,
) -> Result<Json<Tenant>, AppError> {
    state.activate_tenant(&tenant_id, req).await.map(Json)
}

async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Account>, AppError> {
    let actor_id = require_actor(&headers)?;
    state.account_view(&account_id, &actor_id).await.map(Json)
}

async fn list_account_tenants(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Tenant>>, AppError> {
    let actor_id = require_actor(&headers)?;
    state
        .account_tenants_view(&account_id, &actor_id)
        .await
        .map(Json)
}

async fn create_panel(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreatePanelRequest>,
) -> Result<Json<Panel>, AppError> {
    state.create_panel(&tenant_id, req).await.map(Json)
}

async fn list_panels(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Panel>>, AppError> {
    let actor_id = require_actor(&headers)?;
    state.panels_view(&tenant_id, &actor_id).await.map(Json)
}

async fn update_panel(
    State(state): State<AppState>,
    Path((tenant_id, panel_id)): Path<(String, String)>,
    Json(req): Json<UpdatePanelRequest>,
) -> Result<Json<Panel>, AppError> {
    state.update_panel(&tenant_id, &panel_id, req).await.map(Json)
}

async fn delete_panel(
    State(state): State<AppState>,
    Path((tenant_id, panel_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let actor_id = require_actor(&headers)?;
    state.delete_panel(&tenant_id, &panel_id, &actor_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resend_panel(
    State(state): State<AppState>,
    Path((tenant_id, panel_id)): Path<(String, String)>,
    Json(req): Json<ResendPanelRequest>,
) -> Result<Json<Value>, AppError> {
    state.resend_panel(&tenant_id, &panel_id, req).await.map(Json)
}

async fn create_ticket(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<Ticket>, AppError> {
    state.create_ticket(&tenant_id, req).await.map(Json)
}

#[derive(Debug, Deserialize)]
struct TicketFilter {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    panel_id: Option<String>,
}

async fn list_tickets(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(filter): Query<TicketFilter>,
    headers: HeaderMap,
) -> Result<Json<Vec<Ticket>>, AppError> {
    let actor_id = require_actor(&headers)?;
    let status = match filter.status.as_deref() {
        None => None,
        Some("open") => Some(TicketStatus::Open),
        Some("closed") => Some(TicketStatus::Closed),
        Some(other) => {
            return Err(AppError::validation(format!("unknown status filter: {other}")))
        }
    };
    state
        .tickets_view(&tenant_id, &actor_id, status, filter.panel_id.as_deref())
        .await
        .map(Json)
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Ticket>, AppError> {
    let actor_id = require_actor(&headers)?;
    state.ticket_view(&ticket_id, &actor_id).await.map(Json)
}

async fn update_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<UpdateTicketStatusRequest>,
) -> Result<Json<Ticket>, AppError> {
    state.set_ticket_status(&ticket_id, req).await.map(Json)
}

#[derive(Debug, Deserialize)]
struct MessageFilter {
    #[serde(default)]
    after_seq: i64,
}

async fn list_ticket_messages(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(filter): Query<MessageFilter>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, AppError> {
    let actor_id = require_actor(&headers)?;
    state
        .messages_view(&ticket_id, &actor_id, filter.after_seq)
        .await
        .map(Json)
}

async fn append_message(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<AppendMessageRequest>,
) -> Result<Json<Message>, AppError> {
    state.append_console_message(&ticket_id, req).await.map(Json)
}

async fn claim_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<ClaimTicketRequest>,
) -> Result<Json<Ticket>, AppError> {
    state.claim_ticket(&ticket_id, req).await.map(Json)
}

async fn upgrade_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<UpgradeTicketRequest>,
) -> Result<Json<Ticket>, AppError> {
    state.upgrade_ticket(&ticket_id, req).await.map(Json)
}

async fn add_user(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<TicketUserRequest>,
) -> Result<Json<Ticket>, AppError> {
    state.set_participant(&ticket_id, req, true).await.map(Json)
}

async fn remove_user(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<TicketUserRequest>,
) -> Result<Json<Ticket>, AppError> {
    state.set_participant(&ticket_id, req, false).await.map(Json)
}

async fn create_transcript(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<TranscriptRequest>,
) -> Result<Json<Transcript>, AppError> {
    state.generate_transcript(&ticket_id, req).await.map(Json)
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(req): Json<DeleteChannelRequest>,
) -> Result<Json<Ticket>, AppError> {
    state.delete_ticket_channel(&ticket_id, req).await.map(Json)
}

async fn list_knowledge(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<KnowledgeEntry>>, AppError> {
    let actor_id = require_actor(&headers)?;
    state.knowledge_view(&tenant_id, &actor_id).await.map(Json)
}

async fn create_knowledge(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreateKnowledgeRequest>,
) -> Result<Json<KnowledgeEntry>, AppError> {
    state.create_knowledge(&tenant_id, req).await.map(Json)
}

async fn gateway_events(
    State(state): State<AppState>,
    Json(event): Json<GatewayEvent>,
) -> Result<StatusCode, AppError> {
    state.ingest_gateway_event(event).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    state.process_billing_webhook(&headers, &body).await.map(Json)
}

// ---- helpers ----

fn require_actor(headers: &HeaderMap) -> Result<String, AppError> {
    match headers.get("x-actor-id").and_then(|v| v.to_str().ok()) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AppError::Forbidden("X-Actor-Id header is required".to_string())),
    }
}

fn require_field(value: &str, name: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{name} is required")));
    }
    Ok(())
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().as_simple())
}

fn new_correlation() -> String {
    new_id("corr")
}

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

fn status_label(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Open => "open",
        TicketStatus::Closed => "closed",
    }
}

fn ensure_account(
    store: &mut StoreBackend,
    account_id: &str,
    display_name: Option<&str>,
) -> Result<Account, String> {
    match store.get_account(account_id) {
        Some(account) => Ok(account),
        None => {
            let account = Account {
                account_id: account_id.to_string(),
                display_name: display_name.unwrap_or(account_id).to_string(),
                avatar_url: None,
                tokens: 0,
            };
            store.put_account(&account)?;
            Ok(account)
        }
    }
}

fn map_gateway_error(tenant_id: &str, op: &str, err: GatewayError) -> AppError {
    tracing::warn!(tenant_id, op, error = %err, "gateway call failed");
    AppError::Upstream("chat gateway unavailable, try again".to_string())
}

/// Checks a `t=<unix>,v1=<hex>` signature header against the raw body.
/// The signed payload is `"{t}.{body}"`.
fn verify_billing_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), AppError> {
    let mut timestamp: Option<i64> = None;
    let mut provided: Option<&str> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => provided = Some(value),
            _ => {}
        }
    }
    let timestamp = timestamp
        .ok_or_else(|| AppError::InvalidSignature("malformed signature header".to_string()))?;
    let provided = provided
        .ok_or_else(|| AppError::InvalidSignature("malformed signature header".to_string()))?;
    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(AppError::InvalidSignature(
            "signature timestamp outside tolerance".to_string(),
        ));
    }
    let payload = std::str::from_utf8(body)
        .map_err(|_| AppError::InvalidSignature("body must be utf-8".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("hmac init failed: {e}")))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    if expected != provided {
        return Err(AppError::InvalidSignature("signature mismatch".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sign(secret: &str, timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn billing_signature_accepts_valid_header() {
        let body = r#"{"event_id":"evt_1"}"#;
        let sig = sign("secret", 1_700_000_000, body);
        let header = format!("t=1700000000,v1={sig}");
        assert!(
            verify_billing_signature("secret", &header, body.as_bytes(), 300, 1_700_000_050)
                .is_ok()
        );
    }

    #[test]
    fn billing_signature_rejects_tampered_body() {
        let sig = sign("secret", 1_700_000_000, r#"{"event_id":"evt_1"}"#);
        let header = format!("t=1700000000,v1={sig}");
        let err = verify_billing_signature(
            "secret",
            &header,
            br#"{"event_id":"evt_2"}"#,
            300,
            1_700_000_050,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
    }

    #[test]
    fn billing_signature_rejects_stale_timestamp() {
        let body = r#"{"event_id":"evt_1"}"#;
        let sig = sign("secret", 1_700_000_000, body);
        let header = format!("t=1700000000,v1={sig}");
        let err =
            verify_billing_signature("secret", &header, body.as_bytes(), 300, 1_700_100_000)
                .unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
    }

    #[test]
    fn billing_signature_rejects_missing_parts() {
        let err = verify_billing_signature("secret", "v1=abc", b"{}", 300, 0).unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
        let err = verify_billing_signature("secret", "t=0", b"{}", 300, 0).unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
    }

    #[test]
    fn actor_header_is_required_for_reads() {
        let headers = HeaderMap::new();
        assert!(require_actor(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-actor-id", HeaderValue::from_static("op-1"));
        assert_eq!(require_actor(&headers).unwrap(), "op-1");
    }
}
