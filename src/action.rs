//! Inbound events, decoupled from any chat presentation layer
use crate::deal::{PartyId, SessionId};
use crate::error::StoreError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Seller,
    Admin,
    /// Any of the three; enough to read a deal's status.
    Participant,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    #[n(0)]
    Confirmed,
    #[n(1)]
    Rejected,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    #[n(0)]
    Delivered,
    #[n(1)]
    NotDelivered,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    #[n(0)]
    Received,
    #[n(1)]
    NotReceived,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    #[n(0)]
    Release,
    #[n(1)]
    Stop,
}

/// Every state-changing thing a party can ask of a deal.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Action {
    #[n(0)]
    SubmitAddress {
        #[n(0)]
        address: String,
        #[n(1)]
        display_name: String,
    },
    #[n(1)]
    SubmitAccount {
        #[n(0)]
        account: String,
        #[n(1)]
        display_name: String,
    },
    #[n(2)]
    AttestPaymentSent,
    #[n(3)]
    ConfirmPayment(#[n(0)] PaymentOutcome),
    #[n(4)]
    AttestDelivery(#[n(0)] DeliveryOutcome),
    #[n(5)]
    BuyerConfirmReceipt(#[n(0)] ReceiptOutcome),
    #[n(6)]
    AdminRelease(#[n(0)] ReleaseOutcome),
    #[n(7)]
    SellerConfirmReceipt(#[n(0)] ReceiptOutcome),
    #[n(8)]
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Deal(Action),
    QueryStatus,
    ListOpenDeals,
    SetLanguage(String),
    Start,
    HowItWorks,
    ContactAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: PartyId,
    pub display_name: String,
}

/// One event as delivered by the messaging gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub session_id: SessionId,
    pub actor: Actor,
    pub command: Command,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Buyer => f.write_str("buyer"),
            Role::Seller => f.write_str("seller"),
            Role::Admin => f.write_str("admin"),
            Role::Participant => f.write_str("participant"),
        }
    }
}

impl Action {
    /// The role the acting party has to hold for this action.
    pub fn role(&self) -> Role {
        match self {
            Action::SubmitAddress { .. }
            | Action::AttestPaymentSent
            | Action::BuyerConfirmReceipt(_) => Role::Buyer,
            Action::SubmitAccount { .. }
            | Action::AttestDelivery(_)
            | Action::SellerConfirmReceipt(_) => Role::Seller,
            Action::ConfirmPayment(_) | Action::AdminRelease(_) | Action::Cancel => Role::Admin,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::SubmitAddress { .. } => "submit_address",
            Action::SubmitAccount { .. } => "submit_account",
            Action::AttestPaymentSent => "attest_sent",
            Action::ConfirmPayment(PaymentOutcome::Confirmed) => "confirm_received",
            Action::ConfirmPayment(PaymentOutcome::Rejected) => "reject",
            Action::AttestDelivery(DeliveryOutcome::Delivered) => "attest_delivered",
            Action::AttestDelivery(DeliveryOutcome::NotDelivered) => "attest_not_delivered",
            Action::BuyerConfirmReceipt(ReceiptOutcome::Received) => "buyer_confirm_received",
            Action::BuyerConfirmReceipt(ReceiptOutcome::NotReceived) => "buyer_reject_received",
            Action::AdminRelease(ReleaseOutcome::Release) => "release",
            Action::AdminRelease(ReleaseOutcome::Stop) => "stop",
            Action::SellerConfirmReceipt(ReceiptOutcome::Received) => "seller_confirm_received",
            Action::SellerConfirmReceipt(ReceiptOutcome::NotReceived) => "seller_reject_received",
            Action::Cancel => "cancel",
        }
    }
}

impl Actor {
    pub fn new(id: i64, display_name: impl Into<String>) -> Self {
        Self {
            id: PartyId(id),
            display_name: display_name.into(),
        }
    }
}

impl Inbound {
    pub fn new(session_id: i64, actor: Actor, command: Command) -> Self {
        Self {
            session_id: SessionId(session_id),
            actor,
            command,
        }
    }

    pub fn action(session_id: i64, actor: Actor, action: Action) -> Self {
        Self::new(session_id, actor, Command::Deal(action))
    }
}

/// Fingerprint of a deal action as issued by a given party in a given session.
/// Identical events always hash the same, which is what the replay guard relies on.
pub fn event_digest(
    session_id: SessionId,
    actor: PartyId,
    action: &Action,
) -> Result<String, StoreError> {
    let cbor = minicbor::to_vec((session_id, actor, action))
        .map_err(|e| StoreError::Encode(e.to_string()))?;

    Ok(sha256::digest(cbor.as_slice()))
}
