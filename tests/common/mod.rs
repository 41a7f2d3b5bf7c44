//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use escrow_desk::{
    Action, Actor, Inbound, Reply, SessionRouter, Stage,
    action::{DeliveryOutcome, PaymentOutcome, ReceiptOutcome, ReleaseOutcome},
    deal::PartyId,
    dispatcher::{DispatchPolicy, Dispatcher, Gateway, Outbound, Recipient},
    machine::{Arbiter, Template},
    router::RouterSettings,
    store::{DealStore, PreferenceStore, SledStore},
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ADMIN: i64 = 1001;
pub const BUYER: i64 = 11;
pub const SELLER: i64 = 22;
pub const STRANGER: i64 = 99;

#[derive(Default)]
pub struct RecordingGateway {
    pub sent: Mutex<Vec<Outbound>>,
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn deliver(&self, message: &Outbound) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl RecordingGateway {
    /// Templates sent to one party, in order.
    pub fn templates_for(&self, party: i64) -> Vec<Template> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.recipient == Recipient::Party(PartyId(party)))
            .map(|m| m.template)
            .collect()
    }

    pub fn all(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

pub fn arbiter() -> Arbiter {
    Arbiter {
        id: PartyId(ADMIN),
        contact: "@HausaEscrowSupport".into(),
        escrow_account: "Escrow Desk - 0000000000".into(),
    }
}

pub fn router_settings(storage_timeout: Duration) -> RouterSettings {
    RouterSettings {
        arbiter: arbiter(),
        storage_timeout,
        max_conflict_retries: 16,
    }
}

pub fn router_with(
    deals: Arc<dyn DealStore>,
    preferences: Arc<dyn PreferenceStore>,
    storage_timeout: Duration,
) -> (SessionRouter, Arc<RecordingGateway>) {
    let gateway = Arc::new(RecordingGateway::default());
    let dispatcher = Dispatcher::new(
        gateway.clone(),
        Arc::clone(&preferences),
        PartyId(ADMIN),
        DispatchPolicy {
            default_language: "ha".into(),
            attempts: 1,
            backoff: Duration::from_millis(1),
            lookup_timeout: storage_timeout,
        },
    );
    let router = SessionRouter::new(
        deals,
        preferences,
        dispatcher,
        router_settings(storage_timeout),
    );
    (router, gateway)
}

/// A router over a fresh sled database under `dir`.
pub fn sled_router(
    dir: &Path,
) -> anyhow::Result<(SessionRouter, Arc<RecordingGateway>, Arc<SledStore>)> {
    let db = sled::open(dir.join("escrow.db"))?;
    let store = Arc::new(SledStore::new(Arc::new(db))?);
    let (router, gateway) = router_with(store.clone(), store.clone(), Duration::from_secs(5));
    Ok((router, gateway, store))
}

pub fn buyer() -> Actor {
    Actor::new(BUYER, "Aisha")
}

pub fn seller() -> Actor {
    Actor::new(SELLER, "Bello")
}

pub fn admin() -> Actor {
    Actor::new(ADMIN, "Admin")
}

pub fn stranger() -> Actor {
    Actor::new(STRANGER, "Chidi")
}

pub fn submit_address(session: i64, address: &str) -> Inbound {
    Inbound::action(
        session,
        buyer(),
        Action::SubmitAddress {
            address: address.into(),
            display_name: "Aisha".into(),
        },
    )
}

pub fn submit_account(session: i64, account: &str) -> Inbound {
    Inbound::action(
        session,
        seller(),
        Action::SubmitAccount {
            account: account.into(),
            display_name: "Bello".into(),
        },
    )
}

pub fn attest_payment_sent(session: i64, actor: Actor) -> Inbound {
    Inbound::action(session, actor, Action::AttestPaymentSent)
}

pub fn admin_confirm_payment(session: i64, outcome: PaymentOutcome) -> Inbound {
    Inbound::action(session, admin(), Action::ConfirmPayment(outcome))
}

pub fn attest_delivered(session: i64, outcome: DeliveryOutcome) -> Inbound {
    Inbound::action(session, seller(), Action::AttestDelivery(outcome))
}

pub fn buyer_confirm_receipt(session: i64, outcome: ReceiptOutcome) -> Inbound {
    Inbound::action(session, buyer(), Action::BuyerConfirmReceipt(outcome))
}

pub fn admin_release(session: i64, outcome: ReleaseOutcome) -> Inbound {
    Inbound::action(session, admin(), Action::AdminRelease(outcome))
}

pub fn seller_confirm_final_receipt(session: i64, outcome: ReceiptOutcome) -> Inbound {
    Inbound::action(session, seller(), Action::SellerConfirmReceipt(outcome))
}

pub fn admin_cancel(session: i64) -> Inbound {
    Inbound::action(session, admin(), Action::Cancel)
}

/// Drive a session up to `awaiting_delivery`.
pub async fn through_delivery(router: &SessionRouter, session: i64) -> anyhow::Result<()> {
    router.handle(submit_address(session, "TRC20:xyz")).await?;
    router
        .handle(submit_account(session, "Opay 123 - Name"))
        .await?;
    router
        .handle(attest_payment_sent(session, buyer()))
        .await?;
    router
        .handle(admin_confirm_payment(session, PaymentOutcome::Confirmed))
        .await?;
    Ok(())
}

pub fn stage_of(reply: &Reply) -> Stage {
    match reply {
        Reply::Transitioned(summary) | Reply::Unchanged(summary) | Reply::Status(summary) => {
            summary.stage
        }
        other => panic!("reply carries no deal: {other:?}"),
    }
}
