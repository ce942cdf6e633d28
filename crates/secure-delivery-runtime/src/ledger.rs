use secure_delivery::utils::now_millis;
use secure_delivery::StorageAdapter;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::Result;

pub const LEDGER_PREFIX: &str = "v1/delivery-ledger/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Terminal {
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerEntry {
    state: Terminal,
    at: u64,
}

/// Terminal state per logical message id. A message that has failed
/// permanently is never sent again, and its failure is recorded once.
pub struct DeliveryLedger {
    storage: Arc<dyn StorageAdapter>,
    write: Mutex<()>,
}

impl DeliveryLedger {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            write: Mutex::new(()),
        }
    }

    fn key(message_id: &str) -> String {
        format!("{}{}", LEDGER_PREFIX, message_id)
    }

    pub fn terminal(&self, message_id: &str) -> Result<Option<Terminal>> {
        let Some(raw) = self.storage.get(&Self::key(message_id))? else {
            return Ok(None);
        };
        let entry: LedgerEntry = serde_json::from_str(&raw)?;
        Ok(Some(entry.state))
    }

    fn mark(&self, message_id: &str, state: Terminal) -> Result<bool> {
        let _guard = self.write.lock().unwrap();
        if self.terminal(message_id)?.is_some() {
            return Ok(false);
        }
        let entry = LedgerEntry {
            state,
            at: now_millis(),
        };
        self.storage
            .put(&Self::key(message_id), serde_json::to_string(&entry)?)?;
        Ok(true)
    }

    /// Returns `false` if the message already had a terminal state.
    pub fn mark_sent(&self, message_id: &str) -> Result<bool> {
        self.mark(message_id, Terminal::Sent)
    }

    /// Returns `true` only for the first call per message id.
    pub fn mark_failed(&self, message_id: &str) -> Result<bool> {
        self.mark(message_id, Terminal::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secure_delivery::InMemoryStorage;
    use std::thread;

    #[test]
    fn failure_is_recorded_once() {
        let ledger = Arc::new(DeliveryLedger::new(Arc::new(InMemoryStorage::new())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || ledger.mark_failed("m1").unwrap())
            })
            .collect();
        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();

        assert_eq!(firsts, 1);
        assert_eq!(ledger.terminal("m1").unwrap(), Some(Terminal::Failed));
    }

    #[test]
    fn sent_message_cannot_later_fail() {
        let ledger = DeliveryLedger::new(Arc::new(InMemoryStorage::new()));
        assert!(ledger.mark_sent("m1").unwrap());
        assert!(!ledger.mark_failed("m1").unwrap());
        assert_eq!(ledger.terminal("m1").unwrap(), Some(Terminal::Sent));
        assert_eq!(ledger.terminal("m2").unwrap(), None);
    }
}
