use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use haven_core::envelope::DialogEnvelope;
use haven_core::ids::RequestId;

const DEFAULT_TTL: Duration = Duration::from_secs(600);
const DEFAULT_MAX_ENTRIES: usize = 256;

/// Per-request context that outlives the inbound call: agents spawned later
/// by a tool call hold only the request_id and recover the rest from here.
#[derive(Default)]
pub struct RequestContext {
    /// Live channel to the client that opened the request, if still around.
    pub live: Option<mpsc::UnboundedSender<DialogEnvelope>>,
    pub camera_ids: Vec<String>,
    pub tool_source_ids: Vec<String>,
    /// Frames pre-fetched for this request, rawest form available.
    pub frames: Vec<Bytes>,
    pub extra: Value,
}

struct Entry {
    context: Arc<RequestContext>,
    expires_at: Instant,
}

/// TTL + max-size evicted store of request contexts. Passed through call
/// sites explicitly; nothing global.
pub struct RequestContextStore {
    entries: Mutex<HashMap<RequestId, Entry>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for RequestContextStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl RequestContextStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn insert(&self, request_id: RequestId, context: RequestContext) {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        entries.retain(|_, e| e.expires_at > now);

        // Capacity eviction: drop the entry closest to expiry.
        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            request_id,
            Entry {
                context: Arc::new(context),
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn get(&self, request_id: &RequestId) -> Option<Arc<RequestContext>> {
        let entries = self.entries.lock();
        let entry = entries.get(request_id)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.context.clone())
    }

    pub fn remove(&self, request_id: &RequestId) -> Option<Arc<RequestContext>> {
        self.entries.lock().remove(request_id).map(|e| e.context)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
