//! Deal records and the escrow stage enum
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;

/// Identifies the shared chat in which a trade takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(pub i64);

/// A chat participant: buyer, seller or the admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartyId(pub i64);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[n(0)]
    Idle,
    #[n(1)]
    AwaitingSeller,
    #[n(2)]
    AwaitingPayment,
    #[n(3)]
    AwaitingDelivery,
    #[n(4)]
    AwaitingBuyerReceiptConfirmation,
    #[n(5)]
    AwaitingAdminRelease,
    #[n(6)]
    AwaitingSellerReceiptConfirmation,
    #[n(7)]
    Completed,
    #[n(8)]
    Cancelled,
}

// Stored under the session id; the whole record is rewritten on every transition.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Deal {
    #[n(0)]
    pub session_id: SessionId,
    #[n(1)]
    pub reference: String, // bech32 encoded uuid7
    #[n(2)]
    pub buyer_id: Option<PartyId>,
    #[n(3)]
    pub buyer_display_name: String,
    #[n(4)]
    pub buyer_address: Option<String>,
    #[n(5)]
    pub seller_id: Option<PartyId>,
    #[n(6)]
    pub seller_display_name: String,
    #[n(7)]
    pub seller_account: Option<String>,
    #[n(8)]
    pub stage: Stage,
    #[n(9)]
    pub payment_attested: bool,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
}

/// Read-only view handed back to whoever asked for the deal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DealSummary {
    pub session_id: SessionId,
    pub reference: String,
    pub stage: Stage,
    pub buyer: Option<String>,
    pub buyer_address: Option<String>,
    pub seller: Option<String>,
    pub seller_account: Option<String>,
    pub payment_attested: bool,
    pub updated_at: String,
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::AwaitingSeller => "awaiting_seller",
            Stage::AwaitingPayment => "awaiting_payment",
            Stage::AwaitingDelivery => "awaiting_delivery",
            Stage::AwaitingBuyerReceiptConfirmation => "awaiting_buyer_receipt_confirmation",
            Stage::AwaitingAdminRelease => "awaiting_admin_release",
            Stage::AwaitingSellerReceiptConfirmation => "awaiting_seller_receipt_confirmation",
            Stage::Completed => "completed",
            Stage::Cancelled => "cancelled",
        }
    }

    /// Terminal deals are deleted rather than stored.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deal {
    /// A fresh deal, before the buyer has registered anything.
    pub fn new(session_id: SessionId, reference: String, now: TimeStamp<Utc>) -> Self {
        Self {
            session_id,
            reference,
            buyer_id: None,
            buyer_display_name: String::new(),
            buyer_address: None,
            seller_id: None,
            seller_display_name: String::new(),
            seller_account: None,
            stage: Stage::Idle,
            payment_attested: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn is_buyer(&self, party: PartyId) -> bool {
        self.buyer_id == Some(party)
    }

    pub fn is_seller(&self, party: PartyId) -> bool {
        self.seller_id == Some(party)
    }

    pub fn summary(&self) -> DealSummary {
        DealSummary {
            session_id: self.session_id,
            reference: self.reference.clone(),
            stage: self.stage,
            buyer: self.buyer_id.map(|_| self.buyer_display_name.clone()),
            buyer_address: self.buyer_address.clone(),
            seller: self.seller_id.map(|_| self.seller_display_name.clone()),
            seller_account: self.seller_account.clone(),
            payment_attested: self.payment_attested,
            updated_at: self.updated_at.to_datetime_utc().to_rfc3339(),
        }
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl<C> minicbor::Encode<C> for SessionId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for SessionId {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(SessionId(d.i64()?))
    }
}

impl<C> minicbor::Encode<C> for PartyId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for PartyId {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(PartyId(d.i64()?))
    }
}
