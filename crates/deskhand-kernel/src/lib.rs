use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use deskhand_contracts::{
    FieldKind, FormField, KnowledgeEntry, Message, MessageSource, Tenant, Ticket, TicketStatus,
};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

/// Outcome of a claim toggle against the ticket's current claimant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    Claimed,
    Released,
    SelfClaim,
    HeldByOther { holder: String },
}

pub fn evaluate_claim(claimant: Option<&str>, actor: &str, creator: &str) -> ClaimDecision {
    match claimant {
        Some(holder) if holder == actor => ClaimDecision::Released,
        Some(holder) => ClaimDecision::HeldByOther {
            holder: holder.to_string(),
        },
        None if actor == creator => ClaimDecision::SelfClaim,
        None => ClaimDecision::Claimed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDecision {
    Close,
    Reopen,
    Unchanged,
}

pub fn evaluate_status_change(current: TicketStatus, requested: TicketStatus) -> StatusDecision {
    match (current, requested) {
        (TicketStatus::Open, TicketStatus::Closed) => StatusDecision::Close,
        (TicketStatus::Closed, TicketStatus::Open) => StatusDecision::Reopen,
        _ => StatusDecision::Unchanged,
    }
}

pub fn validate_prefix(prefix: &str) -> Result<(), String> {
    if prefix.is_empty() || prefix.len() > 8 {
        return Err("prefix must be 1..=8 characters".to_string());
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err("prefix must contain only uppercase letters and digits".to_string());
    }
    Ok(())
}

pub fn validate_form_fields(fields: &[FormField]) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    for field in fields {
        if field.label.trim().is_empty() {
            return Err("form field label must not be empty".to_string());
        }
        if !seen.insert(field.label.as_str()) {
            return Err(format!("duplicate form field label: {}", field.label));
        }
        if field.kind == FieldKind::Choice && field.options.is_empty() {
            return Err(format!(
                "choice field {} requires at least one option",
                field.label
            ));
        }
    }
    Ok(())
}

pub fn validate_form_answers(
    fields: &[FormField],
    answers: &BTreeMap<String, String>,
) -> Result<(), String> {
    for field in fields {
        match answers.get(&field.label) {
            Some(value) => {
                if field.required && value.trim().is_empty() {
                    return Err(format!("required form field {} is empty", field.label));
                }
                if field.kind == FieldKind::Choice
                    && !value.trim().is_empty()
                    && !field.options.iter().any(|opt| opt == value)
                {
                    return Err(format!(
                        "answer for {} is not one of the configured options",
                        field.label
                    ));
                }
            }
            None if field.required => {
                return Err(format!("required form field {} is missing", field.label));
            }
            None => {}
        }
    }
    for label in answers.keys() {
        if !fields.iter().any(|f| &f.label == label) {
            return Err(format!("unknown form field: {label}"));
        }
    }
    Ok(())
}

pub fn ticket_handle(prefix: &str, number: i64) -> String {
    format!("{prefix}-{number:04}")
}

pub fn channel_name(prefix: &str, number: i64) -> String {
    format!("{}-{number:04}", prefix.to_ascii_lowercase())
}

/// Support attribution is decided against the claimant at append time; the
/// stored flag never changes afterwards.
pub fn is_support_author(author_id: &str, claimant: Option<&str>) -> bool {
    claimant == Some(author_id)
}

pub fn can_manage_tenant(actor_id: &str, tenant: &Tenant) -> bool {
    tenant.owner_id == actor_id || tenant.claim_holder_id.as_deref() == Some(actor_id)
}

pub fn can_view_ticket(actor_id: &str, tenant: &Tenant, ticket: &Ticket) -> bool {
    can_manage_tenant(actor_id, tenant) || ticket.creator_id == actor_id
}

pub fn can_append_message(actor_id: &str, tenant: &Tenant, ticket: &Ticket) -> bool {
    can_manage_tenant(actor_id, tenant)
        || ticket.claimant_id.as_deref() == Some(actor_id)
        || ticket.creator_id == actor_id
}

pub fn can_manage_participants(actor_id: &str, tenant: &Tenant, ticket: &Ticket) -> bool {
    can_manage_tenant(actor_id, tenant) || ticket.claimant_id.as_deref() == Some(actor_id)
}

pub fn opening_message(
    handle: &str,
    creator_id: &str,
    support_role_refs: &[String],
    fields: &[FormField],
    answers: &BTreeMap<String, String>,
) -> String {
    let mut out = format!("Ticket {handle} opened by <@{creator_id}>.");
    if !support_role_refs.is_empty() {
        let mentions: Vec<String> = support_role_refs
            .iter()
            .map(|role| format!("<@&{role}>"))
            .collect();
        out.push('\n');
        out.push_str("Support: ");
        out.push_str(&mentions.join(" "));
    }
    for field in fields {
        if let Some(value) = answers.get(&field.label) {
            out.push('\n');
            out.push_str(&field.label);
            out.push_str(": ");
            out.push_str(value);
        }
    }
    out
}

pub fn panel_announcement(title: &str, prefix: &str) -> String {
    format!("{title}\nOpen a {prefix} ticket from this panel.")
}

pub fn source_name(source: MessageSource) -> &'static str {
    match source {
        MessageSource::OperatorConsole => "operator_console",
        MessageSource::ChatPlatform => "chat_platform",
    }
}

pub fn transcript_line(message: &Message) -> String {
    let mut line = format!(
        "[{}] [{}] {}: {}",
        message.created_at,
        source_name(message.source),
        message.author_name,
        message.content
    );
    if !message.attachments.is_empty() {
        line.push_str(" -- ");
        line.push_str(&message.attachments.join(", "));
    }
    line
}

/// One line per message, append order.
pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(transcript_line)
        .collect::<Vec<String>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderDisposition {
    Confident,
    NeedsHuman,
}

pub fn responder_disposition(
    confidence: f64,
    needs_human: bool,
    threshold: f64,
) -> ResponderDisposition {
    if needs_human || confidence < threshold {
        ResponderDisposition::NeedsHuman
    } else {
        ResponderDisposition::Confident
    }
}

/// Best word-overlap match for the builtin responder. Scores each entry as
/// the share of its trigger words present in the content; zero-score entries
/// never match.
pub fn match_knowledge<'a>(
    entries: &'a [KnowledgeEntry],
    content: &str,
) -> Option<(&'a KnowledgeEntry, f64)> {
    let content_words = tokenize(content);
    let mut best: Option<(&KnowledgeEntry, f64)> = None;
    for entry in entries {
        let trigger_words = tokenize(&entry.trigger);
        if trigger_words.is_empty() {
            continue;
        }
        let hits = trigger_words
            .iter()
            .filter(|w| content_words.contains(*w))
            .count();
        let score = hits as f64 / trigger_words.len() as f64;
        if score <= 0.0 {
            continue;
        }
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((entry, score));
        }
    }
    best
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> Tenant {
        Tenant {
            tenant_id: "guild-1".to_string(),
            name: "Guild".to_string(),
            icon_url: None,
            owner_id: "owner-1".to_string(),
            claim_holder_id: Some("holder-1".to_string()),
            subscription_status: deskhand_contracts::SubscriptionStatus::Active,
            subscription_ref: None,
            manager_role_ref: None,
            anonymous_mode: false,
            identity_name: None,
            identity_avatar_url: None,
        }
    }

    fn ticket() -> Ticket {
        Ticket {
            ticket_id: "t-1".to_string(),
            tenant_id: "guild-1".to_string(),
            panel_id: "p-1".to_string(),
            number: 1,
            prefix: "SUP".to_string(),
            handle: "SUP-0001".to_string(),
            status: TicketStatus::Open,
            creator_id: "user-1".to_string(),
            claimant_id: None,
            channel_ref: None,
            support_role_refs: vec![],
            participants: vec![],
            transcript_channel_ref: None,
            created_at: "2026-03-01T00:00:00Z".to_string(),
            closed_at: None,
            closed_by: None,
            channel_deleted_at: None,
        }
    }

    fn message(seq: i64, content: &str, attachments: Vec<String>) -> Message {
        Message {
            ticket_id: "t-1".to_string(),
            seq,
            author_id: "user-1".to_string(),
            author_name: "User".to_string(),
            author_avatar_url: None,
            content: content.to_string(),
            source: MessageSource::ChatPlatform,
            attachments,
            from_support: false,
            created_at: "2026-03-01T00:00:01Z".to_string(),
        }
    }

    #[test]
    fn claim_toggle_covers_all_outcomes() {
        assert_eq!(
            evaluate_claim(None, "op-a", "user-1"),
            ClaimDecision::Claimed
        );
        assert_eq!(
            evaluate_claim(Some("op-a"), "op-a", "user-1"),
            ClaimDecision::Released
        );
        assert_eq!(
            evaluate_claim(Some("op-a"), "op-b", "user-1"),
            ClaimDecision::HeldByOther {
                holder: "op-a".to_string()
            }
        );
        assert_eq!(
            evaluate_claim(None, "user-1", "user-1"),
            ClaimDecision::SelfClaim
        );
    }

    #[test]
    fn status_change_detects_noop() {
        assert_eq!(
            evaluate_status_change(TicketStatus::Open, TicketStatus::Closed),
            StatusDecision::Close
        );
        assert_eq!(
            evaluate_status_change(TicketStatus::Closed, TicketStatus::Open),
            StatusDecision::Reopen
        );
        assert_eq!(
            evaluate_status_change(TicketStatus::Open, TicketStatus::Open),
            StatusDecision::Unchanged
        );
    }

    #[test]
    fn prefix_must_be_short_uppercase_alphanumeric() {
        assert!(validate_prefix("SUP").is_ok());
        assert!(validate_prefix("TIER2").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("sup").is_err());
        assert!(validate_prefix("SUP-1").is_err());
        assert!(validate_prefix("LONGPREFIX").is_err());
    }

    #[test]
    fn form_answers_are_checked_against_fields() {
        let fields = vec![
            FormField {
                label: "Subject".to_string(),
                kind: FieldKind::Text,
                required: true,
                options: vec![],
            },
            FormField {
                label: "Severity".to_string(),
                kind: FieldKind::Choice,
                required: false,
                options: vec!["low".to_string(), "high".to_string()],
            },
        ];

        let mut answers = BTreeMap::new();
        answers.insert("Subject".to_string(), "Broken build".to_string());
        assert!(validate_form_answers(&fields, &answers).is_ok());

        answers.insert("Severity".to_string(), "medium".to_string());
        assert!(validate_form_answers(&fields, &answers).is_err());

        answers.insert("Severity".to_string(), "high".to_string());
        answers.insert("Extra".to_string(), "nope".to_string());
        assert!(validate_form_answers(&fields, &answers).is_err());

        let empty = BTreeMap::new();
        assert!(validate_form_answers(&fields, &empty).is_err());
    }

    #[test]
    fn choice_fields_require_options() {
        let fields = vec![FormField {
            label: "Severity".to_string(),
            kind: FieldKind::Choice,
            required: false,
            options: vec![],
        }];
        assert!(validate_form_fields(&fields).is_err());
    }

    #[test]
    fn handles_and_channel_names_are_zero_padded() {
        assert_eq!(ticket_handle("SUP", 7), "SUP-0007");
        assert_eq!(ticket_handle("SUP", 12345), "SUP-12345");
        assert_eq!(channel_name("SUP", 7), "sup-0007");
    }

    #[test]
    fn attribution_follows_claimant_at_append_time() {
        assert!(is_support_author("op-a", Some("op-a")));
        assert!(!is_support_author("op-a", Some("op-b")));
        assert!(!is_support_author("op-a", None));
    }

    #[test]
    fn tenant_and_ticket_access_rules() {
        let tenant = tenant();
        let ticket = ticket();
        assert!(can_manage_tenant("owner-1", &tenant));
        assert!(can_manage_tenant("holder-1", &tenant));
        assert!(!can_manage_tenant("user-1", &tenant));
        assert!(can_view_ticket("user-1", &tenant, &ticket));
        assert!(!can_view_ticket("stranger", &tenant, &ticket));
        assert!(can_append_message("user-1", &tenant, &ticket));
        assert!(!can_manage_participants("user-1", &tenant, &ticket));
    }

    #[test]
    fn transcript_has_one_line_per_message() {
        let messages = vec![
            message(1, "hello", vec![]),
            message(2, "see attached", vec!["https://cdn/x.png".to_string()]),
            message(3, "thanks", vec![]),
        ];
        let body = render_transcript(&messages);
        assert_eq!(body.lines().count(), messages.len());
        assert!(body.contains("see attached -- https://cdn/x.png"));
        assert!(body.contains("[chat_platform]"));
    }

    #[test]
    fn opening_message_lists_answers_in_field_order() {
        let fields = vec![
            FormField {
                label: "Subject".to_string(),
                kind: FieldKind::Text,
                required: true,
                options: vec![],
            },
            FormField {
                label: "Details".to_string(),
                kind: FieldKind::Multiline,
                required: false,
                options: vec![],
            },
        ];
        let mut answers = BTreeMap::new();
        answers.insert("Details".to_string(), "It broke".to_string());
        answers.insert("Subject".to_string(), "Help".to_string());

        let body = opening_message(
            "SUP-0001",
            "user-1",
            &["role-9".to_string()],
            &fields,
            &answers,
        );
        let subject_at = body.find("Subject: Help").unwrap();
        let details_at = body.find("Details: It broke").unwrap();
        assert!(subject_at < details_at);
        assert!(body.contains("<@user-1>"));
        assert!(body.contains("<@&role-9>"));
    }

    #[test]
    fn responder_threshold_is_inclusive() {
        assert_eq!(
            responder_disposition(0.6, false, 0.6),
            ResponderDisposition::Confident
        );
        assert_eq!(
            responder_disposition(0.59, false, 0.6),
            ResponderDisposition::NeedsHuman
        );
        assert_eq!(
            responder_disposition(0.9, true, 0.6),
            ResponderDisposition::NeedsHuman
        );
    }

    #[test]
    fn knowledge_match_picks_best_overlap() {
        let entries = vec![
            KnowledgeEntry {
                entry_id: "k-1".to_string(),
                tenant_id: "guild-1".to_string(),
                trigger: "reset password".to_string(),
                answer: "Use /reset.".to_string(),
                auto_captured: false,
                created_at: "2026-03-01T00:00:00Z".to_string(),
            },
            KnowledgeEntry {
                entry_id: "k-2".to_string(),
                tenant_id: "guild-1".to_string(),
                trigger: "billing invoice".to_string(),
                answer: "See the billing tab.".to_string(),
                auto_captured: false,
                created_at: "2026-03-01T00:00:00Z".to_string(),
            },
        ];

        let (entry, score) =
            match_knowledge(&entries, "How do I reset my password?").expect("match");
        assert_eq!(entry.entry_id, "k-1");
        assert!((score - 1.0).abs() < f64::EPSILON);

        assert!(match_knowledge(&entries, "completely unrelated").is_none());
    }
}
