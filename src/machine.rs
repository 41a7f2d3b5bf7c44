//! The escrow state machine.
//!
//! `step` is a pure function from the current deal and a party action to the next deal and the
//! notices the move requires. It never touches storage; the router is responsible for persisting
//! `Transition::next` and handing `Transition::notices` to the dispatcher.
//!
//! ```text
//! idle -> awaiting_seller -> awaiting_payment -> awaiting_delivery
//!      -> awaiting_buyer_receipt_confirmation -> awaiting_admin_release
//!      -> awaiting_seller_receipt_confirmation -> completed
//! ```
//!
//! Every stage from `awaiting_payment` on may divert to `cancelled`, and the admin may cancel
//! from anywhere that is not already terminal.
use crate::action::{
    Action, Actor, DeliveryOutcome, PaymentOutcome, ReceiptOutcome, ReleaseOutcome,
};
use crate::deal::{Deal, PartyId, Stage, TimeStamp};
use crate::error::EscrowError;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

pub type Params = BTreeMap<String, String>;

/// The configured arbitrating admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arbiter {
    pub id: PartyId,
    pub contact: String,
    pub escrow_account: String,
}

/// Who a notice is meant for, resolved to a concrete chat by the dispatcher.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    #[n(0)]
    Buyer,
    #[n(1)]
    Seller,
    #[n(2)]
    Admin,
    #[n(3)]
    Session,
    #[n(4)]
    Actor,
}

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    #[n(0)]
    Welcome,
    #[n(1)]
    HowItWorks,
    #[n(2)]
    AdminContact,
    #[n(3)]
    LanguageSet,
    #[n(4)]
    BuyerAddressRecorded,
    #[n(5)]
    SellerAccountRecorded,
    #[n(6)]
    EscrowDestination,
    #[n(7)]
    PaymentAttested,
    #[n(8)]
    AwaitingAdminConfirmation,
    #[n(9)]
    PaymentConfirmed,
    #[n(10)]
    PaymentRejected,
    #[n(11)]
    DeliverGoods,
    #[n(12)]
    ConfirmReceipt,
    #[n(13)]
    ReleaseRequested,
    #[n(14)]
    FundsReleased,
    #[n(15)]
    ReleaseStopped,
    #[n(16)]
    DealCompleted,
    #[n(17)]
    DealCancelled,
    #[n(18)]
    DisputeOpened,
    #[n(19)]
    DealDisputed,
    #[n(20)]
    ActionRejected,
    #[n(21)]
    TemporarilyUnavailable,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    #[n(0)]
    pub audience: Audience,
    #[n(1)]
    pub template: Template,
    #[n(2)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// What to store under the session afterwards; `None` deletes the deal.
    pub next: Option<Deal>,
    /// The deal as it stands after the move, terminal stages included.
    pub snapshot: Deal,
    pub notices: Vec<Notice>,
}

impl Template {
    pub fn key(&self) -> &'static str {
        match self {
            Template::Welcome => "welcome",
            Template::HowItWorks => "how_it_works",
            Template::AdminContact => "admin_contact",
            Template::LanguageSet => "language_set",
            Template::BuyerAddressRecorded => "buyer_address_recorded",
            Template::SellerAccountRecorded => "seller_account_recorded",
            Template::EscrowDestination => "escrow_destination",
            Template::PaymentAttested => "payment_attested",
            Template::AwaitingAdminConfirmation => "awaiting_admin_confirmation",
            Template::PaymentConfirmed => "payment_confirmed",
            Template::PaymentRejected => "payment_rejected",
            Template::DeliverGoods => "deliver_goods",
            Template::ConfirmReceipt => "confirm_receipt",
            Template::ReleaseRequested => "release_requested",
            Template::FundsReleased => "funds_released",
            Template::ReleaseStopped => "release_stopped",
            Template::DealCompleted => "deal_completed",
            Template::DealCancelled => "deal_cancelled",
            Template::DisputeOpened => "dispute_opened",
            Template::DealDisputed => "deal_disputed",
            Template::ActionRejected => "action_rejected",
            Template::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }
}

impl Notice {
    pub fn new(audience: Audience, template: Template) -> Self {
        Self {
            audience,
            template,
            params: Params::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Apply `action` by `actor` to `deal`.
///
/// The caller has already checked that `actor` holds the role the action requires. Any
/// stage mismatch is an `InvalidTransition` and leaves `deal` untouched.
pub fn step(
    deal: &Deal,
    actor: &Actor,
    action: &Action,
    arbiter: &Arbiter,
    now: TimeStamp<Utc>,
) -> Result<Transition, EscrowError> {
    let invalid = || EscrowError::InvalidTransition {
        stage: deal.stage,
        action: action.name(),
    };

    if deal.stage.is_terminal() {
        return Err(invalid());
    }

    let mut next = deal.clone();
    next.updated_at = now;

    let notices = match (deal.stage, action) {
        (
            Stage::Idle,
            Action::SubmitAddress {
                address,
                display_name,
            },
        ) => {
            next.buyer_id = Some(actor.id);
            next.buyer_display_name = display_name.clone();
            next.buyer_address = Some(address.clone());
            next.stage = Stage::AwaitingSeller;

            vec![
                Notice::new(Audience::Buyer, Template::BuyerAddressRecorded)
                    .with("address", address.clone()),
            ]
        }
        (
            Stage::AwaitingSeller,
            Action::SubmitAccount {
                account,
                display_name,
            },
        ) => {
            next.seller_id = Some(actor.id);
            next.seller_display_name = display_name.clone();
            next.seller_account = Some(account.clone());
            next.stage = Stage::AwaitingPayment;

            vec![
                Notice::new(Audience::Seller, Template::SellerAccountRecorded)
                    .with("account", account.clone()),
                Notice::new(Audience::Buyer, Template::EscrowDestination)
                    .with("escrow_account", arbiter.escrow_account.clone())
                    .with("admin_contact", arbiter.contact.clone())
                    .with("reference", deal.reference.clone()),
            ]
        }
        (Stage::AwaitingPayment, Action::AttestPaymentSent) if !deal.payment_attested => {
            // Stays in awaiting_payment until the admin has checked the escrow account.
            next.payment_attested = true;

            vec![
                with_parties(Notice::new(Audience::Admin, Template::PaymentAttested), deal),
                Notice::new(Audience::Buyer, Template::AwaitingAdminConfirmation),
            ]
        }
        (Stage::AwaitingPayment, Action::ConfirmPayment(PaymentOutcome::Confirmed)) => {
            next.stage = Stage::AwaitingDelivery;

            vec![
                Notice::new(Audience::Seller, Template::DeliverGoods)
                    .with("buyer_address", deal.buyer_address.clone().unwrap_or_default()),
                Notice::new(Audience::Buyer, Template::PaymentConfirmed),
            ]
        }
        (Stage::AwaitingPayment, Action::ConfirmPayment(PaymentOutcome::Rejected)) => {
            next.stage = Stage::Cancelled;

            vec![
                Notice::new(Audience::Buyer, Template::PaymentRejected),
                Notice::new(Audience::Seller, Template::PaymentRejected),
            ]
        }
        (Stage::AwaitingDelivery, Action::AttestDelivery(DeliveryOutcome::Delivered)) => {
            next.stage = Stage::AwaitingBuyerReceiptConfirmation;

            vec![
                Notice::new(Audience::Buyer, Template::ConfirmReceipt)
                    .with("seller", deal.seller_display_name.clone()),
            ]
        }
        (Stage::AwaitingDelivery, Action::AttestDelivery(DeliveryOutcome::NotDelivered)) => {
            next.stage = Stage::Cancelled;
            dispute(deal, arbiter, "seller_not_delivered")
        }
        (
            Stage::AwaitingBuyerReceiptConfirmation,
            Action::BuyerConfirmReceipt(ReceiptOutcome::Received),
        ) => {
            next.stage = Stage::AwaitingAdminRelease;

            vec![with_parties(
                Notice::new(Audience::Admin, Template::ReleaseRequested),
                deal,
            )]
        }
        (
            Stage::AwaitingBuyerReceiptConfirmation,
            Action::BuyerConfirmReceipt(ReceiptOutcome::NotReceived),
        ) => {
            next.stage = Stage::Cancelled;
            dispute(deal, arbiter, "buyer_not_received")
        }
        (Stage::AwaitingAdminRelease, Action::AdminRelease(ReleaseOutcome::Release)) => {
            next.stage = Stage::AwaitingSellerReceiptConfirmation;

            vec![
                Notice::new(Audience::Seller, Template::FundsReleased).with(
                    "seller_account",
                    deal.seller_account.clone().unwrap_or_default(),
                ),
            ]
        }
        (Stage::AwaitingAdminRelease, Action::AdminRelease(ReleaseOutcome::Stop)) => {
            next.stage = Stage::Cancelled;

            vec![
                Notice::new(Audience::Buyer, Template::ReleaseStopped),
                Notice::new(Audience::Seller, Template::ReleaseStopped),
            ]
        }
        (
            Stage::AwaitingSellerReceiptConfirmation,
            Action::SellerConfirmReceipt(ReceiptOutcome::Received),
        ) => {
            next.stage = Stage::Completed;

            vec![
                Notice::new(Audience::Buyer, Template::DealCompleted),
                Notice::new(Audience::Seller, Template::DealCompleted),
                with_parties(Notice::new(Audience::Session, Template::DealCompleted), deal),
            ]
        }
        (
            Stage::AwaitingSellerReceiptConfirmation,
            Action::SellerConfirmReceipt(ReceiptOutcome::NotReceived),
        ) => {
            next.stage = Stage::Cancelled;
            dispute(deal, arbiter, "seller_not_received")
        }
        (_, Action::Cancel) => {
            next.stage = Stage::Cancelled;

            vec![
                Notice::new(Audience::Buyer, Template::DealCancelled),
                Notice::new(Audience::Seller, Template::DealCancelled),
            ]
        }
        _ => return Err(invalid()),
    };

    let snapshot = next.clone();
    let next = (!next.stage.is_terminal()).then_some(next);

    Ok(Transition {
        next,
        snapshot,
        notices,
    })
}

fn with_parties(notice: Notice, deal: &Deal) -> Notice {
    notice
        .with("reference", deal.reference.clone())
        .with("buyer", deal.buyer_display_name.clone())
        .with("seller", deal.seller_display_name.clone())
}

// A contradicted attestation ends the deal and hands it to the admin for manual mediation.
fn dispute(deal: &Deal, arbiter: &Arbiter, reason: &'static str) -> Vec<Notice> {
    vec![
        with_parties(Notice::new(Audience::Admin, Template::DisputeOpened), deal)
            .with("session", deal.session_id.to_string())
            .with("reason", reason),
        Notice::new(Audience::Session, Template::DealDisputed)
            .with("admin_contact", arbiter.contact.clone())
            .with("reason", reason),
    ]
}
