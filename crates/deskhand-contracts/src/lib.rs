use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const API_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    OperatorConsole,
    ChatPlatform,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Multiline,
    Choice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Account {
    pub account_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    pub owner_id: String,
    #[serde(default)]
    pub claim_holder_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    #[serde(default)]
    pub subscription_ref: Option<String>,
    #[serde(default)]
    pub manager_role_ref: Option<String>,
    pub anonymous_mode: bool,
    #[serde(default)]
    pub identity_name: Option<String>,
    #[serde(default)]
    pub identity_avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormField {
    pub label: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Panel {
    pub panel_id: String,
    pub tenant_id: String,
    pub title: String,
    pub channel_ref: String,
    pub category_ref: String,
    pub support_role_refs: Vec<String>,
    #[serde(default)]
    pub transcript_channel_ref: Option<String>,
    pub prefix: String,
    #[serde(default)]
    pub form_fields: Vec<FormField>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ticket {
    pub ticket_id: String,
    pub tenant_id: String,
    pub panel_id: String,
    pub number: i64,
    pub prefix: String,
    pub handle: String,
    pub status: TicketStatus,
    pub creator_id: String,
    #[serde(default)]
    pub claimant_id: Option<String>,
    #[serde(default)]
    pub channel_ref: Option<String>,
    pub support_role_refs: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub transcript_channel_ref: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub closed_by: Option<String>,
    #[serde(default)]
    pub channel_deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub ticket_id: String,
    pub seq: i64,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_avatar_url: Option<String>,
    pub content: String,
    pub source: MessageSource,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub from_support: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeEntry {
    pub entry_id: String,
    pub tenant_id: String,
    pub trigger: String,
    pub answer: String,
    pub auto_captured: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Transcript {
    pub ticket_id: String,
    pub handle: String,
    pub destination_ref: String,
    pub line_count: usize,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterTenantRequest {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    pub owner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTenantRequest {
    pub actor_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub manager_role_ref: Option<String>,
    #[serde(default)]
    pub anonymous_mode: Option<bool>,
    #[serde(default)]
    pub identity_name: Option<String>,
    #[serde(default)]
    pub identity_avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivateTenantRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePanelRequest {
    pub actor_id: String,
    pub title: String,
    pub channel_ref: String,
    pub category_ref: String,
    pub support_role_refs: Vec<String>,
    #[serde(default)]
    pub transcript_channel_ref: Option<String>,
    pub prefix: String,
    #[serde(default)]
    pub form_fields: Vec<FormField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdatePanelRequest {
    pub actor_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub channel_ref: Option<String>,
    #[serde(default)]
    pub category_ref: Option<String>,
    #[serde(default)]
    pub support_role_refs: Option<Vec<String>>,
    #[serde(default)]
    pub transcript_channel_ref: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub form_fields: Option<Vec<FormField>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResendPanelRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTicketRequest {
    pub panel_id: String,
    pub creator_id: String,
    #[serde(default)]
    pub creator_name: Option<String>,
    #[serde(default)]
    pub form_answers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppendMessageRequest {
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_avatar_url: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTicketStatusRequest {
    pub actor_id: String,
    pub status: TicketStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimTicketRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpgradeTicketRequest {
    pub actor_id: String,
    pub role_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketUserRequest {
    pub actor_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteChannelRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateKnowledgeRequest {
    pub actor_id: String,
    pub trigger: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub channel_ref: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_avatar_url: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub occurred_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayCommand {
    pub op: String,
    pub tenant_id: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayResult {
    pub ok: bool,
    #[serde(default)]
    pub resource_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// Billing payloads come from the provider adapter; they are allowed to carry
// fields this service does not know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub event_id: String,
    pub kind: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutCompleted {
    pub tenant_ref: String,
    pub account_ref: String,
    pub subscription_ref: String,
    #[serde(default)]
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionChanged {
    pub subscription_ref: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponderRequest {
    pub tenant_id: String,
    pub ticket_id: String,
    pub handle: String,
    pub content: String,
    pub history: Vec<Message>,
    pub knowledge: Vec<KnowledgeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponderProposal {
    pub reply: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub needs_human: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
