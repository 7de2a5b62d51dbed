use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Append-only JSONL audit sink. Records are hash-chained: each one carries
/// the previous record's hash plus a hash of its own serialized form, so any
/// edit to an earlier line breaks verification of everything after it.
pub struct AuditJsonl {
    sink: Mutex<ChainedSink>,
}

/// The chain tail lives with the file under one lock: reading the previous
/// hash and writing the next record must be a single critical section, or
/// two concurrent appends fork the chain.
struct ChainedSink {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub audit_id: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub action: String,
    pub result: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(tenant_id: &str, correlation_id: &str, action: &str, result: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            tenant_id: tenant_id.to_string(),
            correlation_id: correlation_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            ts: Utc::now().to_rfc3339(),
            subject: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl AuditJsonl {
    pub async fn new(path: &str) -> Result<Self, String> {
        // Resume the chain from the last line when the file already exists.
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            sink: Mutex::new(ChainedSink { file, last_hash }),
        })
    }

    pub async fn append(&self, mut rec: AuditRecord) {
        let mut sink = self.sink.lock().await;
        rec.prev_hash = sink.last_hash.clone();
        if let Ok(seed) = serde_json::to_string(&rec) {
            rec.record_hash = hash_hex(seed.as_bytes());
        }

        if let Ok(line) = serde_json::to_string(&rec) {
            use tokio::io::AsyncWriteExt;
            let _ = sink.file.write_all(line.as_bytes()).await;
            let _ = sink.file.write_all(b"\n").await;
            sink.last_hash = Some(rec.record_hash);
        }
    }
}

fn hash_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if idx > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = hash_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}
