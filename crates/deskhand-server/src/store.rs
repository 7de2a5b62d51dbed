use std::collections::HashMap;

use chrono::Utc;
use deskhand_contracts::{
    Account, KnowledgeEntry, Message, MessageSource, Panel, SubscriptionStatus, Tenant, Ticket,
    TicketStatus,
};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Default)]
pub struct MemoryStore {
    accounts: HashMap<String, Account>,
    tenants: HashMap<String, Tenant>,
    panels: HashMap<String, Panel>,
    ticket_counters: HashMap<String, i64>,
    tickets: HashMap<String, Ticket>,
    messages: HashMap<String, Vec<Message>>,
    knowledge: HashMap<String, Vec<KnowledgeEntry>>,
    processed_events: HashMap<String, String>,
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

pub struct SqliteStore {
    conn: Connection,
}

/// Result of a token balance adjustment. A negative delta that would push
/// the balance below zero is refused without changing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    Applied(i64),
    InsufficientTokens,
}

impl StoreBackend {
    pub fn get_account(&self, account_id: &str) -> Option<Account> {
        match self {
            StoreBackend::Memory(store) => store.accounts.get(account_id).cloned(),
            StoreBackend::Sqlite(store) => store.get_account(account_id).ok().flatten(),
        }
    }

    pub fn put_account(&mut self, account: &Account) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .accounts
                    .insert(account.account_id.clone(), account.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_account(account),
        }
    }

    pub fn adjust_tokens(&mut self, account_id: &str, delta: i64) -> Result<TokenOutcome, String> {
        match self {
            StoreBackend::Memory(store) => match store.accounts.get_mut(account_id) {
                Some(account) => {
                    let next = account.tokens + delta;
                    if next < 0 {
                        Ok(TokenOutcome::InsufficientTokens)
                    } else {
                        account.tokens = next;
                        Ok(TokenOutcome::Applied(next))
                    }
                }
                None => Err(format!("unknown account: {account_id}")),
            },
            StoreBackend::Sqlite(store) => store.adjust_tokens(account_id, delta),
        }
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Option<Tenant> {
        match self {
            StoreBackend::Memory(store) => store.tenants.get(tenant_id).cloned(),
            StoreBackend::Sqlite(store) => store.get_tenant(tenant_id).ok().flatten(),
        }
    }

    pub fn put_tenant(&mut self, tenant: &Tenant) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .tenants
                    .insert(tenant.tenant_id.clone(), tenant.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_tenant(tenant),
        }
    }

    pub fn find_tenant_by_subscription(&self, subscription_ref: &str) -> Option<Tenant> {
        match self {
            StoreBackend::Memory(store) => store
                .tenants
                .values()
                .find(|t| t.subscription_ref.as_deref() == Some(subscription_ref))
                .cloned(),
            StoreBackend::Sqlite(store) => store
                .find_tenant_by_subscription(subscription_ref)
                .ok()
                .flatten(),
        }
    }

    pub fn list_tenants_for_account(&self, account_id: &str) -> Vec<Tenant> {
        let mut tenants = match self {
            StoreBackend::Memory(store) => store
                .tenants
                .values()
                .filter(|t| {
                    t.owner_id == account_id || t.claim_holder_id.as_deref() == Some(account_id)
                })
                .cloned()
                .collect::<Vec<_>>(),
            StoreBackend::Sqlite(store) => {
                store.list_tenants_for_account(account_id).unwrap_or_default()
            }
        };
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        tenants
    }

    pub fn get_panel(&self, panel_id: &str) -> Option<Panel> {
        match self {
            StoreBackend::Memory(store) => store.panels.get(panel_id).cloned(),
            StoreBackend::Sqlite(store) => store.get_panel(panel_id).ok().flatten(),
        }
    }

    pub fn put_panel(&mut self, panel: &Panel) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.panels.insert(panel.panel_id.clone(), panel.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_panel(panel),
        }
    }

    /// Soft-deleted panels are kept for ticket history but never listed.
    pub fn list_panels(&self, tenant_id: &str) -> Vec<Panel> {
        let mut panels = match self {
            StoreBackend::Memory(store) => store
                .panels
                .values()
                .filter(|p| p.tenant_id == tenant_id && !p.deleted)
                .cloned()
                .collect::<Vec<_>>(),
            StoreBackend::Sqlite(store) => store.list_panels(tenant_id).unwrap_or_default(),
        };
        panels.sort_by(|a, b| a.panel_id.cmp(&b.panel_id));
        panels
    }

    pub fn next_ticket_number(&mut self, tenant_id: &str, prefix: &str) -> Result<i64, String> {
        match self {
            StoreBackend::Memory(store) => {
                let value = store
                    .ticket_counters
                    .entry(format!("{tenant_id}:{prefix}"))
                    .or_insert(0);
                *value += 1;
                Ok(*value)
            }
            StoreBackend::Sqlite(store) => store.next_ticket_number(tenant_id, prefix),
        }
    }

    pub fn get_ticket(&self, ticket_id: &str) -> Option<Ticket> {
        match self {
            StoreBackend::Memory(store) => store.tickets.get(ticket_id).cloned(),
            StoreBackend::Sqlite(store) => store.get_ticket(ticket_id).ok().flatten(),
        }
    }

    pub fn put_ticket(&mut self, ticket: &Ticket) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .tickets
                    .insert(ticket.ticket_id.clone(), ticket.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_ticket(ticket),
        }
    }

    pub fn list_tickets(
        &self,
        tenant_id: &str,
        status: Option<TicketStatus>,
        panel_id: Option<&str>,
    ) -> Vec<Ticket> {
        let mut tickets = match self {
            StoreBackend::Memory(store) => {
                let mut out: Vec<Ticket> = store
                    .tickets
                    .values()
                    .filter(|t| t.tenant_id == tenant_id)
                    .cloned()
                    .collect();
                out.sort_by(|a, b| {
                    (a.created_at.as_str(), a.number).cmp(&(b.created_at.as_str(), b.number))
                });
                out
            }
            StoreBackend::Sqlite(store) => store.list_tickets(tenant_id).unwrap_or_default(),
        };
        if let Some(status) = status {
            tickets.retain(|t| t.status == status);
        }
        if let Some(panel_id) = panel_id {
            tickets.retain(|t| t.panel_id == panel_id);
        }
        tickets
    }

    pub fn find_ticket_by_channel(&self, channel_ref: &str) -> Option<Ticket> {
        match self {
            StoreBackend::Memory(store) => store
                .tickets
                .values()
                .find(|t| t.channel_ref.as_deref() == Some(channel_ref))
                .cloned(),
            StoreBackend::Sqlite(store) => {
                store.find_ticket_by_channel(channel_ref).ok().flatten()
            }
        }
    }

    pub fn count_open_tickets_for_creator(&self, tenant_id: &str, creator_id: &str) -> usize {
        match self {
            StoreBackend::Memory(store) => store
                .tickets
                .values()
                .filter(|t| {
                    t.tenant_id == tenant_id
                        && t.creator_id == creator_id
                        && t.status == TicketStatus::Open
                })
                .count(),
            StoreBackend::Sqlite(store) => store
                .count_open_tickets_for_creator(tenant_id, creator_id)
                .unwrap_or(0),
        }
    }

    /// Compare-and-swap on the claimant. The write only lands when the
    /// stored claimant still equals `expected`; returns whether it did.
    pub fn set_claimant(
        &mut self,
        ticket_id: &str,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => match store.tickets.get_mut(ticket_id) {
                Some(ticket) if ticket.claimant_id.as_deref() == expected => {
                    ticket.claimant_id = next.map(|v| v.to_string());
                    Ok(true)
                }
                _ => Ok(false),
            },
            StoreBackend::Sqlite(store) => store.set_claimant(ticket_id, expected, next),
        }
    }

    pub fn next_message_seq(&self, ticket_id: &str) -> Result<i64, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .messages
                .get(ticket_id)
                .and_then(|v| v.last())
                .map(|m| m.seq)
                .unwrap_or(0)
                + 1),
            StoreBackend::Sqlite(store) => store.next_message_seq(ticket_id),
        }
    }

    pub fn put_message(&mut self, message: &Message) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .messages
                    .entry(message.ticket_id.clone())
                    .or_default()
                    .push(message.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_message(message),
        }
    }

    pub fn list_messages(&self, ticket_id: &str, after_seq: i64) -> Vec<Message> {
        match self {
            StoreBackend::Memory(store) => store
                .messages
                .get(ticket_id)
                .map(|v| {
                    v.iter()
                        .filter(|m| m.seq > after_seq)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            StoreBackend::Sqlite(store) => {
                store.list_messages(ticket_id, after_seq).unwrap_or_default()
            }
        }
    }

    pub fn put_knowledge(&mut self, entry: &KnowledgeEntry) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .knowledge
                    .entry(entry.tenant_id.clone())
                    .or_default()
                    .push(entry.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_knowledge(entry),
        }
    }

    pub fn list_knowledge(&self, tenant_id: &str) -> Vec<KnowledgeEntry> {
        match self {
            StoreBackend::Memory(store) => {
                store.knowledge.get(tenant_id).cloned().unwrap_or_default()
            }
            StoreBackend::Sqlite(store) => store.list_knowledge(tenant_id).unwrap_or_default(),
        }
    }

    pub fn knowledge_trigger_exists(&self, tenant_id: &str, trigger: &str) -> bool {
        match self {
            StoreBackend::Memory(store) => store
                .knowledge
                .get(tenant_id)
                .map(|entries| {
                    entries
                        .iter()
                        .any(|e| e.trigger.eq_ignore_ascii_case(trigger))
                })
                .unwrap_or(false),
            StoreBackend::Sqlite(store) => store
                .knowledge_trigger_exists(tenant_id, trigger)
                .unwrap_or(false),
        }
    }

    pub fn event_processed(&self, event_id: &str) -> bool {
        match self {
            StoreBackend::Memory(store) => store.processed_events.contains_key(event_id),
            StoreBackend::Sqlite(store) => store.event_processed(event_id).unwrap_or(false),
        }
    }

    pub fn mark_event_processed(&mut self, event_id: &str, kind: &str) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .processed_events
                    .insert(event_id.to_string(), kind.to_string());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.mark_event_processed(event_id, kind),
        }
    }
}

const TENANT_COLS: &str = "tenant_id, name, icon_url, owner_id, claim_holder_id, \
     subscription_status, subscription_ref, manager_role_ref, anonymous_mode, identity_name, \
     identity_avatar_url";
const PANEL_COLS: &str = "panel_id, tenant_id, title, channel_ref, category_ref, \
     support_role_refs, transcript_channel_ref, prefix, form_fields, deleted";
const TICKET_COLS: &str = "ticket_id, tenant_id, panel_id, number, prefix, handle, status, \
     creator_id, claimant_id, channel_ref, support_role_refs, participants, \
     transcript_channel_ref, created_at, closed_at, closed_by, channel_deleted_at";
const MESSAGE_COLS: &str = "ticket_id, seq, author_id, author_name, author_avatar_url, content, \
     source, attachments, from_support, created_at";
const KNOWLEDGE_COLS: &str =
    "entry_id, tenant_id, trigger_phrase, answer, auto_captured, created_at";

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_url TEXT,
                tokens INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                icon_url TEXT,
                owner_id TEXT NOT NULL,
                claim_holder_id TEXT,
                subscription_status TEXT NOT NULL,
                subscription_ref TEXT,
                manager_role_ref TEXT,
                anonymous_mode INTEGER NOT NULL,
                identity_name TEXT,
                identity_avatar_url TEXT
            );
            CREATE TABLE IF NOT EXISTS panels (
                panel_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                title TEXT NOT NULL,
                channel_ref TEXT NOT NULL,
                category_ref TEXT NOT NULL,
                support_role_refs TEXT NOT NULL,
                transcript_channel_ref TEXT,
                prefix TEXT NOT NULL,
                form_fields TEXT NOT NULL,
                deleted INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ticket_counters (
                tenant_id TEXT NOT NULL,
                prefix TEXT NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, prefix)
            );
            CREATE TABLE IF NOT EXISTS tickets (
                ticket_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                panel_id TEXT NOT NULL,
                number INTEGER NOT NULL,
                prefix TEXT NOT NULL,
                handle TEXT NOT NULL,
                status TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                claimant_id TEXT,
                channel_ref TEXT,
                support_role_refs TEXT NOT NULL,
                participants TEXT NOT NULL,
                transcript_channel_ref TEXT,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                closed_by TEXT,
                channel_deleted_at TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                ticket_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                author_id TEXT NOT NULL,
                author_name TEXT NOT NULL,
                author_avatar_url TEXT,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                attachments TEXT NOT NULL,
                from_support INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (ticket_id, seq)
            );
            -- TRIGGER is a reserved word, hence trigger_phrase.
            CREATE TABLE IF NOT EXISTS knowledge (
                entry_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                trigger_phrase TEXT NOT NULL,
                answer TEXT NOT NULL,
                auto_captured INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn get_account(&self, account_id: &str) -> Result<Option<Account>, String> {
        self.conn
            .query_row(
                "SELECT account_id, display_name, avatar_url, tokens FROM accounts WHERE account_id = ?1",
                params![account_id],
                row_to_account,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn put_account(&mut self, account: &Account) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO accounts (account_id, display_name, avatar_url, tokens)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![
                    account.account_id,
                    account.display_name,
                    account.avatar_url,
                    account.tokens
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn adjust_tokens(&mut self, account_id: &str, delta: i64) -> Result<TokenOutcome, String> {
        let changed = self
            .conn
            .execute(
                "UPDATE accounts SET tokens = tokens + ?2 WHERE account_id = ?1 AND tokens + ?2 >= 0",
                params![account_id, delta],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            let tokens: Option<i64> = self
                .conn
                .query_row(
                    "SELECT tokens FROM accounts WHERE account_id = ?1",
                    params![account_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| e.to_string())?;
            return match tokens {
                Some(_) => Ok(TokenOutcome::InsufficientTokens),
                None => Err(format!("unknown account: {account_id}")),
            };
        }
        let tokens: i64 = self
            .conn
            .query_row(
                "SELECT tokens FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        Ok(TokenOutcome::Applied(tokens))
    }

    fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TENANT_COLS} FROM tenants WHERE tenant_id = ?1"),
                params![tenant_id],
                row_to_tenant,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn put_tenant(&mut self, tenant: &Tenant) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO tenants
                (tenant_id, name, icon_url, owner_id, claim_holder_id, subscription_status,
                 subscription_ref, manager_role_ref, anonymous_mode, identity_name,
                 identity_avatar_url)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ",
                params![
                    tenant.tenant_id,
                    tenant.name,
                    tenant.icon_url,
                    tenant.owner_id,
                    tenant.claim_holder_id,
                    subscription_status_name(tenant.subscription_status),
                    tenant.subscription_ref,
                    tenant.manager_role_ref,
                    if tenant.anonymous_mode { 1 } else { 0 },
                    tenant.identity_name,
                    tenant.identity_avatar_url
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn find_tenant_by_subscription(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<Tenant>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TENANT_COLS} FROM tenants WHERE subscription_ref = ?1"),
                params![subscription_ref],
                row_to_tenant,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn list_tenants_for_account(&self, account_id: &str) -> Result<Vec<Tenant>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TENANT_COLS} FROM tenants WHERE owner_id = ?1 OR claim_holder_id = ?1"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![account_id], row_to_tenant)
            .map_err(|e| e.to_string())?;
        collect_rows(rows)
    }

    fn get_panel(&self, panel_id: &str) -> Result<Option<Panel>, String> {
        self.conn
            .query_row(
                &format!("SELECT {PANEL_COLS} FROM panels WHERE panel_id = ?1"),
                params![panel_id],
                row_to_panel,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn put_panel(&mut self, panel: &Panel) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO panels
                (panel_id, tenant_id, title, channel_ref, category_ref, support_role_refs,
                 transcript_channel_ref, prefix, form_fields, deleted)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
                params![
                    panel.panel_id,
                    panel.tenant_id,
                    panel.title,
                    panel.channel_ref,
                    panel.category_ref,
                    json_text(&panel.support_role_refs)?,
                    panel.transcript_channel_ref,
                    panel.prefix,
                    json_text(&panel.form_fields)?,
                    if panel.deleted { 1 } else { 0 }
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn list_panels(&self, tenant_id: &str) -> Result<Vec<Panel>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PANEL_COLS} FROM panels WHERE tenant_id = ?1 AND deleted = 0"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_panel)
            .map_err(|e| e.to_string())?;
        collect_rows(rows)
    }

    fn next_ticket_number(&mut self, tenant_id: &str, prefix: &str) -> Result<i64, String> {
        self.conn
            .execute(
                "
                INSERT INTO ticket_counters (tenant_id, prefix, value)
                VALUES (?1, ?2, 1)
                ON CONFLICT(tenant_id, prefix) DO UPDATE SET value = value + 1
                ",
                params![tenant_id, prefix],
            )
            .map_err(|e| e.to_string())?;
        self.conn
            .query_row(
                "SELECT value FROM ticket_counters WHERE tenant_id = ?1 AND prefix = ?2",
                params![tenant_id, prefix],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())
    }

    fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TICKET_COLS} FROM tickets WHERE ticket_id = ?1"),
                params![ticket_id],
                row_to_ticket,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn put_ticket(&mut self, ticket: &Ticket) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO tickets
                (ticket_id, tenant_id, panel_id, number, prefix, handle, status, creator_id,
                 claimant_id, channel_ref, support_role_refs, participants,
                 transcript_channel_ref, created_at, closed_at, closed_by, channel_deleted_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                ",
                params![
                    ticket.ticket_id,
                    ticket.tenant_id,
                    ticket.panel_id,
                    ticket.number,
                    ticket.prefix,
                    ticket.handle,
                    ticket_status_name(ticket.status),
                    ticket.creator_id,
                    ticket.claimant_id,
                    ticket.channel_ref,
                    json_text(&ticket.support_role_refs)?,
                    json_text(&ticket.participants)?,
                    ticket.transcript_channel_ref,
                    ticket.created_at,
                    ticket.closed_at,
                    ticket.closed_by,
                    ticket.channel_deleted_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn list_tickets(&self, tenant_id: &str) -> Result<Vec<Ticket>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TICKET_COLS} FROM tickets WHERE tenant_id = ?1 ORDER BY created_at, number"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_ticket)
            .map_err(|e| e.to_string())?;
        collect_rows(rows)
    }

    fn find_ticket_by_channel(&self, channel_ref: &str) -> Result<Option<Ticket>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TICKET_COLS} FROM tickets WHERE channel_ref = ?1"),
                params![channel_ref],
                row_to_ticket,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn count_open_tickets_for_creator(
        &self,
        tenant_id: &str,
        creator_id: &str,
    ) -> Result<usize, String> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tickets WHERE tenant_id = ?1 AND creator_id = ?2 AND status = 'open'",
                params![tenant_id, creator_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        Ok(count as usize)
    }

    fn set_claimant(
        &mut self,
        ticket_id: &str,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool, String> {
        let changed = match expected {
            Some(current) => self.conn.execute(
                "UPDATE tickets SET claimant_id = ?2 WHERE ticket_id = ?1 AND claimant_id = ?3",
                params![ticket_id, next, current],
            ),
            None => self.conn.execute(
                "UPDATE tickets SET claimant_id = ?2 WHERE ticket_id = ?1 AND claimant_id IS NULL",
                params![ticket_id, next],
            ),
        }
        .map_err(|e| e.to_string())?;
        Ok(changed == 1)
    }

    fn next_message_seq(&self, ticket_id: &str) -> Result<i64, String> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE ticket_id = ?1",
                params![ticket_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())
    }

    fn put_message(&mut self, message: &Message) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO messages
                (ticket_id, seq, author_id, author_name, author_avatar_url, content, source,
                 attachments, from_support, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
                params![
                    message.ticket_id,
                    message.seq,
                    message.author_id,
                    message.author_name,
                    message.author_avatar_url,
                    message.content,
                    message_source_name(message.source),
                    json_text(&message.attachments)?,
                    if message.from_support { 1 } else { 0 },
                    message.created_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn list_messages(&self, ticket_id: &str, after_seq: i64) -> Result<Vec<Message>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages WHERE ticket_id = ?1 AND seq > ?2 ORDER BY seq"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![ticket_id, after_seq], row_to_message)
            .map_err(|e| e.to_string())?;
        collect_rows(rows)
    }

    fn put_knowledge(&mut self, entry: &KnowledgeEntry) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO knowledge
                (entry_id, tenant_id, trigger_phrase, answer, auto_captured, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    entry.entry_id,
                    entry.tenant_id,
                    entry.trigger,
                    entry.answer,
                    if entry.auto_captured { 1 } else { 0 },
                    entry.created_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn list_knowledge(&self, tenant_id: &str) -> Result<Vec<KnowledgeEntry>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {KNOWLEDGE_COLS} FROM knowledge WHERE tenant_id = ?1 ORDER BY created_at, entry_id"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_knowledge)
            .map_err(|e| e.to_string())?;
        collect_rows(rows)
    }

    fn knowledge_trigger_exists(&self, tenant_id: &str, trigger: &str) -> Result<bool, String> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM knowledge WHERE tenant_id = ?1 AND LOWER(trigger_phrase) = LOWER(?2)",
                params![tenant_id, trigger],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        Ok(count > 0)
    }

    fn event_processed(&self, event_id: &str) -> Result<bool, String> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT event_id FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        Ok(found.is_some())
    }

    fn mark_event_processed(&mut self, event_id: &str, kind: &str) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO processed_events (event_id, kind, processed_at) VALUES (?1, ?2, ?3)",
                params![event_id, kind, Utc::now().to_rfc3339()],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, String> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| e.to_string())?);
    }
    Ok(out)
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        account_id: row.get(0)?,
        display_name: row.get(1)?,
        avatar_url: row.get(2)?,
        tokens: row.get(3)?,
    })
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        tenant_id: row.get(0)?,
        name: row.get(1)?,
        icon_url: row.get(2)?,
        owner_id: row.get(3)?,
        claim_holder_id: row.get(4)?,
        subscription_status: parse_subscription_status(&row.get::<_, String>(5)?),
        subscription_ref: row.get(6)?,
        manager_role_ref: row.get(7)?,
        anonymous_mode: row.get::<_, i64>(8)? != 0,
        identity_name: row.get(9)?,
        identity_avatar_url: row.get(10)?,
    })
}

fn row_to_panel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Panel> {
    Ok(Panel {
        panel_id: row.get(0)?,
        tenant_id: row.get(1)?,
        title: row.get(2)?,
        channel_ref: row.get(3)?,
        category_ref: row.get(4)?,
        support_role_refs: json_column(5, row.get::<_, String>(5)?)?,
        transcript_channel_ref: row.get(6)?,
        prefix: row.get(7)?,
        form_fields: json_column(8, row.get::<_, String>(8)?)?,
        deleted: row.get::<_, i64>(9)? != 0,
    })
}

fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        ticket_id: row.get(0)?,
        tenant_id: row.get(1)?,
        panel_id: row.get(2)?,
        number: row.get(3)?,
        prefix: row.get(4)?,
        handle: row.get(5)?,
        status: parse_ticket_status(&row.get::<_, String>(6)?),
        creator_id: row.get(7)?,
        claimant_id: row.get(8)?,
        channel_ref: row.get(9)?,
        support_role_refs: json_column(10, row.get::<_, String>(10)?)?,
        participants: json_column(11, row.get::<_, String>(11)?)?,
        transcript_channel_ref: row.get(12)?,
        created_at: row.get(13)?,
        closed_at: row.get(14)?,
        closed_by: row.get(15)?,
        channel_deleted_at: row.get(16)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        ticket_id: row.get(0)?,
        seq: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        author_avatar_url: row.get(4)?,
        content: row.get(5)?,
        source: parse_message_source(&row.get::<_, String>(6)?),
        attachments: json_column(7, row.get::<_, String>(7)?)?,
        from_support: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

fn row_to_knowledge(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        entry_id: row.get(0)?,
        tenant_id: row.get(1)?,
        trigger: row.get(2)?,
        answer: row.get(3)?,
        auto_captured: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

fn json_text<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| e.to_string())
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn subscription_status_name(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::None => "none",
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::Inactive => "inactive",
    }
}

fn parse_subscription_status(raw: &str) -> SubscriptionStatus {
    match raw {
        "active" => SubscriptionStatus::Active,
        "inactive" => SubscriptionStatus::Inactive,
        _ => SubscriptionStatus::None,
    }
}

fn ticket_status_name(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Open => "open",
        TicketStatus::Closed => "closed",
    }
}

fn parse_ticket_status(raw: &str) -> TicketStatus {
    match raw {
        "closed" => TicketStatus::Closed,
        _ => TicketStatus::Open,
    }
}

fn message_source_name(source: MessageSource) -> &'static str {
    match source {
        MessageSource::OperatorConsole => "operator_console",
        MessageSource::ChatPlatform => "chat_platform",
    }
}

fn parse_message_source(raw: &str) -> MessageSource {
    match raw {
        "operator_console" => MessageSource::OperatorConsole,
        _ => MessageSource::ChatPlatform,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("deskhand-store-{tag}-{}.db", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string()
    }

    fn sample_ticket() -> Ticket {
        Ticket {
            ticket_id: "tkt_1".to_string(),
            tenant_id: "guild-1".to_string(),
            panel_id: "pnl_1".to_string(),
            number: 7,
            prefix: "SUP".to_string(),
            handle: "SUP-0007".to_string(),
            status: TicketStatus::Open,
            creator_id: "user-1".to_string(),
            claimant_id: None,
            channel_ref: Some("chan-7".to_string()),
            support_role_refs: vec!["role-a".to_string(), "role-b".to_string()],
            participants: vec!["user-2".to_string()],
            transcript_channel_ref: None,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            closed_at: None,
            closed_by: None,
            channel_deleted_at: None,
        }
    }

    #[test]
    fn sqlite_ticket_roundtrip_preserves_list_fields() {
        let path = temp_db_path("roundtrip");
        let mut store = StoreBackend::Sqlite(SqliteStore::new(&path).unwrap());
        store.put_ticket(&sample_ticket()).unwrap();

        let loaded = store.get_ticket("tkt_1").unwrap();
        assert_eq!(loaded.support_role_refs, vec!["role-a", "role-b"]);
        assert_eq!(loaded.participants, vec!["user-2"]);
        assert_eq!(loaded.status, TicketStatus::Open);
        assert!(store.find_ticket_by_channel("chan-7").is_some());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn set_claimant_only_lands_when_expectation_holds() {
        let mut store = StoreBackend::Memory(MemoryStore::default());
        store.put_ticket(&sample_ticket()).unwrap();

        assert!(store.set_claimant("tkt_1", None, Some("agent-1")).unwrap());
        // Second unclaimed-to-claimed write must lose.
        assert!(!store.set_claimant("tkt_1", None, Some("agent-2")).unwrap());
        assert_eq!(
            store.get_ticket("tkt_1").unwrap().claimant_id.as_deref(),
            Some("agent-1")
        );
        assert!(store
            .set_claimant("tkt_1", Some("agent-1"), None)
            .unwrap());
    }

    #[test]
    fn ticket_counter_is_scoped_per_tenant_and_prefix() {
        let mut store = StoreBackend::Memory(MemoryStore::default());
        assert_eq!(store.next_ticket_number("guild-1", "SUP").unwrap(), 1);
        assert_eq!(store.next_ticket_number("guild-1", "SUP").unwrap(), 2);
        assert_eq!(store.next_ticket_number("guild-1", "BUG").unwrap(), 1);
        assert_eq!(store.next_ticket_number("guild-2", "SUP").unwrap(), 1);
    }

    #[test]
    fn sqlite_message_seq_counts_from_one_per_ticket() {
        let path = temp_db_path("seq");
        let mut store = StoreBackend::Sqlite(SqliteStore::new(&path).unwrap());
        store.put_ticket(&sample_ticket()).unwrap();

        assert_eq!(store.next_message_seq("tkt_1").unwrap(), 1);
        store
            .put_message(&Message {
                ticket_id: "tkt_1".to_string(),
                seq: 1,
                author_id: "user-1".to_string(),
                author_name: "Pat".to_string(),
                author_avatar_url: None,
                content: "hello".to_string(),
                source: MessageSource::ChatPlatform,
                attachments: Vec::new(),
                from_support: false,
                created_at: "2026-01-01T00:00:01+00:00".to_string(),
            })
            .unwrap();
        assert_eq!(store.next_message_seq("tkt_1").unwrap(), 2);
        assert_eq!(store.next_message_seq("tkt_other").unwrap(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_token_decrement_stops_at_zero() {
        let path = temp_db_path("tokens");
        let mut store = StoreBackend::Sqlite(SqliteStore::new(&path).unwrap());
        store
            .put_account(&Account {
                account_id: "acc-1".to_string(),
                display_name: "acc-1".to_string(),
                avatar_url: None,
                tokens: 1,
            })
            .unwrap();

        assert_eq!(
            store.adjust_tokens("acc-1", -1).unwrap(),
            TokenOutcome::Applied(0)
        );
        assert_eq!(
            store.adjust_tokens("acc-1", -1).unwrap(),
            TokenOutcome::InsufficientTokens
        );
        assert_eq!(store.get_account("acc-1").unwrap().tokens, 0);

        let _ = std::fs::remove_file(&path);
    }
}
