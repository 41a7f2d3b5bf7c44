//! Durable deal and preference storage.
//!
//! Deals are kept whole: every write replaces the full CBOR-encoded record under its session id,
//! and the router only ever writes through `compare_and_swap` so that two transitions racing on
//! the same session cannot both land.
//!
//! Every swap also records a [`Receipt`] for the session in the same atomic write. It outlives
//! the deal itself, so a replayed event can still deliver the notices of a transition whose
//! write landed after the caller had given up on it.
use crate::deal::{Deal, PartyId, SessionId};
use crate::error::StoreError;
use crate::machine::Notice;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::sync::Arc;
use std::time::Duration;

const DEALS_TREE: &str = "deals";
const RECEIPTS_TREE: &str = "receipts";
const PREFERENCES_TREE: &str = "preferences";

/// The stored value no longer matches what the caller read.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("deal changed since it was read")]
pub struct CasConflict;

/// The last event applied to a session and what it must tell the parties.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    #[n(0)]
    pub digest: String, // sha256 of the applied inbound event
    #[n(1)]
    pub actor: PartyId,
    #[n(2)]
    pub snapshot: Deal,
    #[n(3)]
    pub notices: Vec<Notice>,
    /// Nobody has claimed the notices for dispatch yet.
    #[n(4)]
    pub pending: bool,
}

pub trait DealStore: Send + Sync {
    fn get(&self, session_id: SessionId) -> Result<Option<Deal>, StoreError>;
    /// Upsert, last write wins.
    fn save(&self, deal: &Deal) -> Result<(), StoreError>;
    fn delete(&self, session_id: SessionId) -> Result<(), StoreError>;
    fn list_all(&self) -> Result<Vec<Deal>, StoreError>;
    /// Replace `expected` with `new` only if the session still holds exactly `expected`, and
    /// record `receipt` for the session in the same write. `None` on either side means "no deal".
    fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected: Option<&Deal>,
        new: Option<&Deal>,
        receipt: &Receipt,
    ) -> Result<Result<(), CasConflict>, StoreError>;
    fn receipt(&self, session_id: SessionId) -> Result<Option<Receipt>, StoreError>;
    /// Mark the session's pending receipt for `digest` as dispatched. Only the caller that gets
    /// `true` back may send its notices.
    fn claim_receipt(&self, session_id: SessionId, digest: &str) -> Result<bool, StoreError>;
}

pub trait PreferenceStore: Send + Sync {
    fn language(&self, party: PartyId) -> Result<Option<String>, StoreError>;
    fn set_language(&self, party: PartyId, tag: &str) -> Result<(), StoreError>;
}

pub struct SledStore {
    deals: sled::Tree,
    receipts: sled::Tree,
    preferences: sled::Tree,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, StoreError> {
        Ok(Self {
            deals: instance.open_tree(DEALS_TREE)?,
            receipts: instance.open_tree(RECEIPTS_TREE)?,
            preferences: instance.open_tree(PREFERENCES_TREE)?,
        })
    }
}

fn deal_key(session_id: SessionId) -> [u8; 8] {
    session_id.0.to_be_bytes()
}

fn party_key(party: PartyId) -> [u8; 8] {
    party.0.to_be_bytes()
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

impl DealStore for SledStore {
    fn get(&self, session_id: SessionId) -> Result<Option<Deal>, StoreError> {
        match self.deals.get(deal_key(session_id))? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, deal: &Deal) -> Result<(), StoreError> {
        self.deals
            .insert(deal_key(deal.session_id), encode(deal)?)?;
        Ok(())
    }

    fn delete(&self, session_id: SessionId) -> Result<(), StoreError> {
        self.deals.remove(deal_key(session_id))?;
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<Deal>, StoreError> {
        let mut deals = Vec::new();
        for entry in self.deals.iter() {
            let (_, bytes) = entry?;
            deals.push(minicbor::decode(&bytes)?);
        }
        Ok(deals)
    }

    fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected: Option<&Deal>,
        new: Option<&Deal>,
        receipt: &Receipt,
    ) -> Result<Result<(), CasConflict>, StoreError> {
        let key = deal_key(session_id);
        let expected = expected.map(encode).transpose()?;
        let new = new.map(encode).transpose()?;
        let receipt = encode(receipt)?;

        let outcome = (&self.deals, &self.receipts).transaction(|(deals, receipts)| {
            if deals.get(&key[..])?.as_deref() != expected.as_deref() {
                return Err(ConflictableTransactionError::Abort(CasConflict));
            }
            match &new {
                Some(bytes) => deals.insert(&key[..], bytes.as_slice())?,
                None => deals.remove(&key[..])?,
            };
            receipts.insert(&key[..], receipt.as_slice())?;
            Ok(())
        });

        match outcome {
            Ok(()) => Ok(Ok(())),
            Err(TransactionError::Abort(conflict)) => Ok(Err(conflict)),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn receipt(&self, session_id: SessionId) -> Result<Option<Receipt>, StoreError> {
        match self.receipts.get(deal_key(session_id))? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn claim_receipt(&self, session_id: SessionId, digest: &str) -> Result<bool, StoreError> {
        let key = deal_key(session_id);
        let Some(current) = self.receipts.get(key)? else {
            return Ok(false);
        };

        let mut receipt: Receipt = minicbor::decode(&current)?;
        if receipt.digest != digest || !receipt.pending {
            return Ok(false);
        }
        receipt.pending = false;

        Ok(self
            .receipts
            .compare_and_swap(key, Some(current), Some(encode(&receipt)?))?
            .is_ok())
    }
}

impl PreferenceStore for SledStore {
    fn language(&self, party: PartyId) -> Result<Option<String>, StoreError> {
        match self.preferences.get(party_key(party))? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    fn set_language(&self, party: PartyId, tag: &str) -> Result<(), StoreError> {
        self.preferences.insert(party_key(party), tag.as_bytes())?;
        Ok(())
    }
}

/// Run a blocking store call off the async workers, giving up after `limit`.
///
/// A call that times out keeps running on its blocking thread; its write may still land, which
/// the router's replay guard accounts for.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(call)).await {
        Ok(joined) => joined?,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
