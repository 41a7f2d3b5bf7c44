//! In-process store, for ephemeral runs and tests.
use crate::deal::{Deal, PartyId, SessionId};
use crate::error::StoreError;
use crate::store::{CasConflict, DealStore, PreferenceStore, Receipt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryStore {
    deals: Mutex<HashMap<SessionId, Deal>>,
    receipts: Mutex<HashMap<SessionId, Receipt>>,
    preferences: Mutex<HashMap<PartyId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
}

impl DealStore for MemoryStore {
    fn get(&self, session_id: SessionId) -> Result<Option<Deal>, StoreError> {
        Ok(lock(&self.deals)?.get(&session_id).cloned())
    }

    fn save(&self, deal: &Deal) -> Result<(), StoreError> {
        lock(&self.deals)?.insert(deal.session_id, deal.clone());
        Ok(())
    }

    fn delete(&self, session_id: SessionId) -> Result<(), StoreError> {
        lock(&self.deals)?.remove(&session_id);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<Deal>, StoreError> {
        Ok(lock(&self.deals)?.values().cloned().collect())
    }

    fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected: Option<&Deal>,
        new: Option<&Deal>,
        receipt: &Receipt,
    ) -> Result<Result<(), CasConflict>, StoreError> {
        // always deals before receipts
        let mut deals = lock(&self.deals)?;
        let mut receipts = lock(&self.receipts)?;

        if deals.get(&session_id) != expected {
            return Ok(Err(CasConflict));
        }
        match new {
            Some(deal) => deals.insert(session_id, deal.clone()),
            None => deals.remove(&session_id),
        };
        receipts.insert(session_id, receipt.clone());
        Ok(Ok(()))
    }

    fn receipt(&self, session_id: SessionId) -> Result<Option<Receipt>, StoreError> {
        Ok(lock(&self.receipts)?.get(&session_id).cloned())
    }

    fn claim_receipt(&self, session_id: SessionId, digest: &str) -> Result<bool, StoreError> {
        let mut receipts = lock(&self.receipts)?;

        match receipts.get_mut(&session_id) {
            Some(receipt) if receipt.pending && receipt.digest == digest => {
                receipt.pending = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl PreferenceStore for MemoryStore {
    fn language(&self, party: PartyId) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.preferences)?.get(&party).cloned())
    }

    fn set_language(&self, party: PartyId, tag: &str) -> Result<(), StoreError> {
        lock(&self.preferences)?.insert(party, tag.to_string());
        Ok(())
    }
}
