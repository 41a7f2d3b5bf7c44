//! Racing events on one session, and storage that fails or stalls mid-transition.
mod common;

use common::*;
use escrow_desk::{
    Action, Actor, EscrowError, Inbound, Reply, SessionId, Stage,
    action::{DeliveryOutcome, PaymentOutcome, ReceiptOutcome, ReleaseOutcome},
    deal::{Deal, PartyId},
    error::StoreError,
    machine::Template,
    memory_store::MemoryStore,
    store::{CasConflict, DealStore, Receipt},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn memory_router() -> (
    Arc<escrow_desk::SessionRouter>,
    Arc<RecordingGateway>,
    Arc<MemoryStore>,
) {
    let store = Arc::new(MemoryStore::new());
    let (router, gateway) = router_with(store.clone(), store.clone(), Duration::from_secs(5));
    (Arc::new(router), gateway, store)
}

async fn at_payment(router: &escrow_desk::SessionRouter, session: i64) -> anyhow::Result<()> {
    router.handle(submit_address(session, "TRC20:xyz")).await?;
    router
        .handle(submit_account(session, "Opay 123 - Name"))
        .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_admin_confirmations_apply_once() -> anyhow::Result<()> {
    let (router, gateway, store) = memory_router();
    at_payment(&router, 1).await?;
    gateway.clear();

    let first = tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.handle(admin_confirm_payment(1, PaymentOutcome::Confirmed)).await }
    });
    let second = tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.handle(admin_confirm_payment(1, PaymentOutcome::Confirmed)).await }
    });
    let replies = [first.await??, second.await??];

    let transitioned = replies
        .iter()
        .filter(|r| matches!(r, Reply::Transitioned(_)))
        .count();
    let unchanged = replies
        .iter()
        .filter(|r| matches!(r, Reply::Unchanged(_)))
        .count();
    assert_eq!((transitioned, unchanged), (1, 1));

    assert_eq!(
        store.get(SessionId(1))?.map(|d| d.stage),
        Some(Stage::AwaitingDelivery)
    );
    // the seller is told to deliver exactly once
    assert_eq!(gateway.templates_for(SELLER), vec![Template::DeliverGoods]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirm_and_reject_race_has_one_winner() -> anyhow::Result<()> {
    for session in 0..20 {
        let (router, _gateway, store) = memory_router();
        at_payment(&router, session).await?;

        let confirm = tokio::spawn({
            let router = Arc::clone(&router);
            async move {
                router
                    .handle(admin_confirm_payment(session, PaymentOutcome::Confirmed))
                    .await
            }
        });
        let reject = tokio::spawn({
            let router = Arc::clone(&router);
            async move {
                router
                    .handle(admin_confirm_payment(session, PaymentOutcome::Rejected))
                    .await
            }
        });
        let (confirm, reject) = (confirm.await?, reject.await?);

        match (&confirm, &reject) {
            (Ok(Reply::Transitioned(won)), Err(EscrowError::InvalidTransition { stage, .. })) => {
                assert_eq!(won.stage, Stage::AwaitingDelivery);
                assert_eq!(*stage, Stage::AwaitingDelivery);
                assert_eq!(
                    store.get(SessionId(session))?.map(|d| d.stage),
                    Some(Stage::AwaitingDelivery)
                );
            }
            (Err(EscrowError::NoSuchDeal(_)), Ok(Reply::Transitioned(won))) => {
                assert_eq!(won.stage, Stage::Cancelled);
                assert!(store.get(SessionId(session))?.is_none());
            }
            other => panic!("both or neither transition applied: {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_buyer_claims_a_session() -> anyhow::Result<()> {
    let (router, _gateway, store) = memory_router();
    let rival = Actor::new(12, "Musa");

    let first = tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.handle(submit_address(7, "TRC20:aaa")).await }
    });
    let second = tokio::spawn({
        let router = Arc::clone(&router);
        async move {
            router
                .handle(Inbound::action(
                    7,
                    rival,
                    Action::SubmitAddress {
                        address: "TRC20:bbb".into(),
                        display_name: "Musa".into(),
                    },
                ))
                .await
        }
    });
    let results = [first.await?, second.await?];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(EscrowError::Unauthorized { .. })))
    );

    let deal = store.get(SessionId(7))?.expect("one buyer registered");
    let expected_address = match deal.buyer_id {
        Some(PartyId(BUYER)) => "TRC20:aaa",
        Some(PartyId(12)) => "TRC20:bbb",
        other => panic!("unexpected buyer {other:?}"),
    };
    assert_eq!(deal.buyer_address.as_deref(), Some(expected_address));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_sessions_progress_in_parallel() -> anyhow::Result<()> {
    let (router, _gateway, store) = memory_router();

    let mut tasks = tokio::task::JoinSet::new();
    for session in 100..116 {
        let router = Arc::clone(&router);
        tasks.spawn(async move {
            through_delivery(&router, session).await?;
            router
                .handle(attest_delivered(session, DeliveryOutcome::Delivered))
                .await?;
            router
                .handle(buyer_confirm_receipt(session, ReceiptOutcome::Received))
                .await?;
            router
                .handle(admin_release(session, ReleaseOutcome::Release))
                .await?;
            let reply = router
                .handle(seller_confirm_final_receipt(session, ReceiptOutcome::Received))
                .await?;
            anyhow::Ok(stage_of(&reply))
        });
    }

    while let Some(done) = tasks.join_next().await {
        assert_eq!(done??, Stage::Completed);
    }
    assert!(store.list_all()?.is_empty());
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    BeforeWrite,
    AfterWrite,
}

/// Fails the next compare-and-swap once, either before or after it reaches the inner store.
struct FlakyStore {
    inner: MemoryStore,
    armed: AtomicBool,
    failure: Failure,
}

impl FlakyStore {
    fn new(failure: Failure) -> Self {
        Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
            failure,
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl DealStore for FlakyStore {
    fn get(&self, session_id: SessionId) -> Result<Option<Deal>, StoreError> {
        self.inner.get(session_id)
    }

    fn save(&self, deal: &Deal) -> Result<(), StoreError> {
        self.inner.save(deal)
    }

    fn delete(&self, session_id: SessionId) -> Result<(), StoreError> {
        self.inner.delete(session_id)
    }

    fn list_all(&self) -> Result<Vec<Deal>, StoreError> {
        self.inner.list_all()
    }

    fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected: Option<&Deal>,
        new: Option<&Deal>,
        receipt: &Receipt,
    ) -> Result<Result<(), CasConflict>, StoreError> {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return self.inner.compare_and_swap(session_id, expected, new, receipt);
        }

        let lost = || Err(StoreError::Unavailable("connection reset".into()));
        match self.failure {
            Failure::BeforeWrite => lost(),
            Failure::AfterWrite => {
                let written = self
                    .inner
                    .compare_and_swap(session_id, expected, new, receipt)?;
                if written.is_err() {
                    return Ok(written);
                }
                lost()
            }
        }
    }

    fn receipt(&self, session_id: SessionId) -> Result<Option<Receipt>, StoreError> {
        self.inner.receipt(session_id)
    }

    fn claim_receipt(&self, session_id: SessionId, digest: &str) -> Result<bool, StoreError> {
        self.inner.claim_receipt(session_id, digest)
    }
}

fn flaky_router(
    failure: Failure,
) -> (
    escrow_desk::SessionRouter,
    Arc<RecordingGateway>,
    Arc<FlakyStore>,
) {
    let store = Arc::new(FlakyStore::new(failure));
    let preferences = Arc::new(MemoryStore::new());
    let (router, gateway) = router_with(store.clone(), preferences, Duration::from_secs(5));
    (router, gateway, store)
}

#[tokio::test]
async fn failed_write_can_be_retried() -> anyhow::Result<()> {
    let (router, gateway, store) = flaky_router(Failure::BeforeWrite);
    at_payment(&router, 1).await?;
    gateway.clear();

    store.arm();
    let res = router
        .handle(admin_confirm_payment(1, PaymentOutcome::Confirmed))
        .await;
    assert!(matches!(res, Err(EscrowError::StorageUnavailable(_))));
    assert_eq!(
        store.get(SessionId(1))?.map(|d| d.stage),
        Some(Stage::AwaitingPayment)
    );
    assert_eq!(
        gateway.templates_for(ADMIN),
        vec![Template::TemporarilyUnavailable]
    );

    let reply = router
        .handle(admin_confirm_payment(1, PaymentOutcome::Confirmed))
        .await?;
    assert!(matches!(reply, Reply::Transitioned(_)));
    assert_eq!(stage_of(&reply), Stage::AwaitingDelivery);
    Ok(())
}

#[tokio::test]
async fn write_that_landed_is_not_applied_twice() -> anyhow::Result<()> {
    let (router, gateway, store) = flaky_router(Failure::AfterWrite);
    at_payment(&router, 1).await?;
    gateway.clear();

    store.arm();
    let res = router
        .handle(admin_confirm_payment(1, PaymentOutcome::Confirmed))
        .await;
    assert!(matches!(res, Err(EscrowError::StorageUnavailable(_))));
    // the write went through even though the caller never heard back
    assert_eq!(
        store.get(SessionId(1))?.map(|d| d.stage),
        Some(Stage::AwaitingDelivery)
    );

    // nobody has been told yet
    assert!(gateway.templates_for(SELLER).is_empty());
    assert!(gateway.templates_for(BUYER).is_empty());

    let reply = router
        .handle(admin_confirm_payment(1, PaymentOutcome::Confirmed))
        .await?;
    assert!(matches!(reply, Reply::Unchanged(_)));
    assert_eq!(stage_of(&reply), Stage::AwaitingDelivery);
    assert_eq!(gateway.templates_for(SELLER), vec![Template::DeliverGoods]);
    assert_eq!(gateway.templates_for(BUYER), vec![Template::PaymentConfirmed]);

    // a third attempt has nothing left to send
    let reply = router
        .handle(admin_confirm_payment(1, PaymentOutcome::Confirmed))
        .await?;
    assert!(matches!(reply, Reply::Unchanged(_)));
    assert_eq!(gateway.templates_for(SELLER), vec![Template::DeliverGoods]);
    Ok(())
}

#[tokio::test]
async fn dispute_that_landed_still_reaches_the_admin() -> anyhow::Result<()> {
    let (router, gateway, store) = flaky_router(Failure::AfterWrite);
    through_delivery(&router, 2).await?;
    gateway.clear();

    store.arm();
    let res = router
        .handle(attest_delivered(2, DeliveryOutcome::NotDelivered))
        .await;
    assert!(matches!(res, Err(EscrowError::StorageUnavailable(_))));
    assert!(store.get(SessionId(2))?.is_none());
    assert!(gateway.templates_for(ADMIN).is_empty());

    let reply = router
        .handle(attest_delivered(2, DeliveryOutcome::NotDelivered))
        .await?;

    assert!(matches!(reply, Reply::Unchanged(_)));
    assert_eq!(stage_of(&reply), Stage::Cancelled);
    assert_eq!(gateway.templates_for(ADMIN), vec![Template::DisputeOpened]);
    let disputed = gateway
        .all()
        .into_iter()
        .find(|m| m.template == Template::DealDisputed)
        .expect("session told about the dispute");
    assert_eq!(disputed.params["reason"], "seller_not_delivered");

    // any other event on the closed session still finds no deal
    let res = router.handle(admin_cancel(2)).await;
    assert_eq!(res, Err(EscrowError::NoSuchDeal(SessionId(2))));
    Ok(())
}

/// A deal store whose reads stall longer than the router is willing to wait.
struct StalledStore {
    inner: MemoryStore,
    delay: Duration,
}

impl DealStore for StalledStore {
    fn get(&self, session_id: SessionId) -> Result<Option<Deal>, StoreError> {
        std::thread::sleep(self.delay);
        self.inner.get(session_id)
    }

    fn save(&self, deal: &Deal) -> Result<(), StoreError> {
        self.inner.save(deal)
    }

    fn delete(&self, session_id: SessionId) -> Result<(), StoreError> {
        self.inner.delete(session_id)
    }

    fn list_all(&self) -> Result<Vec<Deal>, StoreError> {
        self.inner.list_all()
    }

    fn compare_and_swap(
        &self,
        session_id: SessionId,
        expected: Option<&Deal>,
        new: Option<&Deal>,
        receipt: &Receipt,
    ) -> Result<Result<(), CasConflict>, StoreError> {
        self.inner.compare_and_swap(session_id, expected, new, receipt)
    }

    fn receipt(&self, session_id: SessionId) -> Result<Option<Receipt>, StoreError> {
        self.inner.receipt(session_id)
    }

    fn claim_receipt(&self, session_id: SessionId, digest: &str) -> Result<bool, StoreError> {
        self.inner.claim_receipt(session_id, digest)
    }
}

#[tokio::test]
async fn stalled_storage_times_out() -> anyhow::Result<()> {
    let store = Arc::new(StalledStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(300),
    });
    let preferences = Arc::new(MemoryStore::new());
    let (router, gateway) = router_with(store, preferences, Duration::from_millis(30));

    let res = router.handle(submit_address(1, "TRC20:xyz")).await;

    assert!(matches!(res, Err(EscrowError::StorageUnavailable(_))));
    assert!(res.is_err_and(|err| err.is_retryable()));
    assert_eq!(
        gateway.templates_for(BUYER),
        vec![Template::TemporarilyUnavailable]
    );
    Ok(())
}

/// A deal store where somebody else always got there first.
struct ContendedStore {
    inner: MemoryStore,
}

impl DealStore for ContendedStore {
    fn get(&self, session_id: SessionId) -> Result<Option<Deal>, StoreError> {
        self.inner.get(session_id)
    }

    fn save(&self, deal: &Deal) -> Result<(), StoreError> {
        self.inner.save(deal)
    }

    fn delete(&self, session_id: SessionId) -> Result<(), StoreError> {
        self.inner.delete(session_id)
    }

    fn list_all(&self) -> Result<Vec<Deal>, StoreError> {
        self.inner.list_all()
    }

    fn compare_and_swap(
        &self,
        _session_id: SessionId,
        _expected: Option<&Deal>,
        _new: Option<&Deal>,
        _receipt: &Receipt,
    ) -> Result<Result<(), CasConflict>, StoreError> {
        Ok(Err(CasConflict))
    }

    fn receipt(&self, session_id: SessionId) -> Result<Option<Receipt>, StoreError> {
        self.inner.receipt(session_id)
    }

    fn claim_receipt(&self, session_id: SessionId, digest: &str) -> Result<bool, StoreError> {
        self.inner.claim_receipt(session_id, digest)
    }
}

#[tokio::test]
async fn endless_contention_gives_up() -> anyhow::Result<()> {
    let store = Arc::new(ContendedStore {
        inner: MemoryStore::new(),
    });
    let preferences = Arc::new(MemoryStore::new());
    let (router, gateway) = router_with(store, preferences, Duration::from_secs(5));

    let res = router.handle(submit_address(1, "TRC20:xyz")).await;

    let Err(EscrowError::StorageUnavailable(reason)) = &res else {
        panic!("expected the router to give up, got {res:?}");
    };
    assert!(reason.contains("kept changing"));

    let diagnostics = gateway.all();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].template, Template::TemporarilyUnavailable);
    assert!(diagnostics[0].params["reason"].contains("kept changing"));
    Ok(())
}
