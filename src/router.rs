//! Session router: turns inbound events into checked, persisted deal transitions.
//!
//! Each deal action is an optimistic read-modify-write. The router loads the deal, checks the
//! actor's identity, runs the state machine and writes the result with a compare-and-swap
//! against exactly what it loaded. A lost race re-runs the whole step on fresh data, so two
//! transitions on one session can never both apply to the same starting stage.
//!
//! The same write records a receipt of the event. An event whose digest matches the receipt is a
//! replay: it changes nothing, but it still sends the transition's notices if they never went
//! out. That covers writes that landed after the caller had already seen a storage timeout.
use crate::action::{Action, Actor, Command, Inbound, Role, event_digest};
use crate::deal::{Deal, DealSummary, SessionId, TimeStamp};
use crate::dispatcher::{Addressing, Dispatcher};
use crate::error::EscrowError;
use crate::machine::{self, Arbiter, Audience, Notice, Template};
use crate::store::{CasConflict, DealStore, PreferenceStore, Receipt, bounded};
use crate::utils::new_deal_reference;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub arbiter: Arbiter,
    pub storage_timeout: Duration,
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The action moved the deal; the summary shows where it ended up.
    Transitioned(DealSummary),
    /// The exact same event was already applied, nothing changed.
    Unchanged(DealSummary),
    Status(DealSummary),
    OpenDeals(Vec<DealSummary>),
    Acknowledged,
}

pub struct SessionRouter {
    deals: Arc<dyn DealStore>,
    preferences: Arc<dyn PreferenceStore>,
    dispatcher: Dispatcher,
    settings: RouterSettings,
}

impl SessionRouter {
    pub fn new(
        deals: Arc<dyn DealStore>,
        preferences: Arc<dyn PreferenceStore>,
        dispatcher: Dispatcher,
        settings: RouterSettings,
    ) -> Self {
        Self {
            deals,
            preferences,
            dispatcher,
            settings,
        }
    }

    /// Handle one inbound event. Any error has already been reported to the acting party
    /// when this returns.
    pub async fn handle(&self, event: Inbound) -> Result<Reply, EscrowError> {
        let arbiter = &self.settings.arbiter;

        let result = match &event.command {
            Command::Deal(action) => self.apply(&event, action).await,
            Command::QueryStatus => self.status(&event).await,
            Command::ListOpenDeals => self.open_deals(&event.actor).await,
            Command::SetLanguage(tag) => self.set_language(&event, tag).await,
            Command::Start => {
                self.inform(
                    &event,
                    Notice::new(Audience::Actor, Template::Welcome)
                        .with("admin_contact", arbiter.contact.clone()),
                )
                .await
            }
            Command::HowItWorks => {
                self.inform(&event, Notice::new(Audience::Actor, Template::HowItWorks))
                    .await
            }
            Command::ContactAdmin => {
                self.inform(
                    &event,
                    Notice::new(Audience::Actor, Template::AdminContact)
                        .with("admin_contact", arbiter.contact.clone()),
                )
                .await
            }
        };

        if let Err(err) = &result {
            self.report(&event, err).await;
        }
        result
    }

    async fn apply(&self, event: &Inbound, action: &Action) -> Result<Reply, EscrowError> {
        let session_id = event.session_id;
        let actor = &event.actor;
        let arbiter = &self.settings.arbiter;
        let digest = event_digest(session_id, actor.id, action)?;

        for attempt in 0..=self.settings.max_conflict_retries {
            // The deal is read before the receipt: a receipt can only be newer than the deal.
            let current = self.load(session_id).await?;

            if let Some(receipt) = self
                .last_receipt(session_id)
                .await?
                .filter(|receipt| receipt.digest == digest)
            {
                debug!(session = %session_id, actor = %actor.id, "replayed event, nothing to do");
                self.release(session_id, &receipt).await;
                return Ok(Reply::Unchanged(receipt.snapshot.summary()));
            }

            authorize(session_id, current.as_ref(), actor, action, arbiter)?;

            let base = match &current {
                Some(deal) => deal.clone(),
                None => Deal::new(session_id, mint_reference(session_id), TimeStamp::new()),
            };
            let transition = machine::step(&base, actor, action, arbiter, TimeStamp::new())?;
            let receipt = Receipt {
                digest: digest.clone(),
                actor: actor.id,
                snapshot: transition.snapshot,
                notices: transition.notices,
                pending: true,
            };

            match self
                .swap(session_id, current, transition.next, receipt.clone())
                .await?
            {
                Ok(()) => {
                    info!(
                        session = %session_id,
                        actor = %actor.id,
                        action = action.name(),
                        from = %base.stage,
                        to = %receipt.snapshot.stage,
                        "deal transitioned"
                    );
                    self.release(session_id, &receipt).await;
                    return Ok(Reply::Transitioned(receipt.snapshot.summary()));
                }
                Err(CasConflict) => {
                    debug!(session = %session_id, attempt, "deal changed underneath, retrying");
                }
            }
        }

        warn!(session = %session_id, "conflict retries exhausted");
        Err(EscrowError::StorageUnavailable(format!(
            "session {session_id} kept changing, gave up after {} attempts",
            self.settings.max_conflict_retries + 1
        )))
    }

    // Send the receipt's notices if nobody else has. A claim that cannot be recorded still
    // sends: a duplicate message beats a lost one.
    async fn release(&self, session_id: SessionId, receipt: &Receipt) {
        let deals = Arc::clone(&self.deals);
        let digest = receipt.digest.clone();
        let claimed = match bounded(self.settings.storage_timeout, move || {
            deals.claim_receipt(session_id, &digest)
        })
        .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                warn!(
                    session = %session_id,
                    error = %err,
                    "could not claim notices, sending anyway"
                );
                true
            }
        };
        if !claimed {
            debug!(session = %session_id, "notices already sent");
            return;
        }

        let addressing = Addressing::for_deal(&receipt.snapshot, receipt.actor);
        self.dispatcher
            .dispatch(&addressing, receipt.notices.clone())
            .await;
    }

    async fn status(&self, event: &Inbound) -> Result<Reply, EscrowError> {
        let deal = self
            .load(event.session_id)
            .await?
            .ok_or(EscrowError::NoSuchDeal(event.session_id))?;

        let actor = event.actor.id;
        if !(deal.is_buyer(actor) || deal.is_seller(actor) || actor == self.settings.arbiter.id) {
            return Err(EscrowError::Unauthorized {
                actor,
                role: Role::Participant,
            });
        }

        Ok(Reply::Status(deal.summary()))
    }

    async fn open_deals(&self, actor: &Actor) -> Result<Reply, EscrowError> {
        if actor.id != self.settings.arbiter.id {
            return Err(EscrowError::Unauthorized {
                actor: actor.id,
                role: Role::Admin,
            });
        }

        let deals = Arc::clone(&self.deals);
        let deals = bounded(self.settings.storage_timeout, move || deals.list_all()).await?;

        Ok(Reply::OpenDeals(deals.iter().map(Deal::summary).collect()))
    }

    async fn set_language(&self, event: &Inbound, tag: &str) -> Result<Reply, EscrowError> {
        let tag = tag.trim().to_lowercase();
        let party = event.actor.id;

        let preferences = Arc::clone(&self.preferences);
        let stored = tag.clone();
        bounded(self.settings.storage_timeout, move || {
            preferences.set_language(party, &stored)
        })
        .await?;

        info!(party = %party, language = %tag, "language preference updated");
        self.inform(
            event,
            Notice::new(Audience::Actor, Template::LanguageSet).with("language", tag),
        )
        .await
    }

    async fn inform(&self, event: &Inbound, notice: Notice) -> Result<Reply, EscrowError> {
        let addressing = Addressing::for_actor(event.session_id, event.actor.id);
        self.dispatcher.dispatch(&addressing, vec![notice]).await;
        Ok(Reply::Acknowledged)
    }

    // One diagnostic to whoever sent the failed event.
    async fn report(&self, event: &Inbound, err: &EscrowError) {
        let notice = match err {
            EscrowError::StorageUnavailable(_) => {
                error!(
                    session = %event.session_id,
                    actor = %event.actor.id,
                    error = %err,
                    "storage unavailable"
                );
                Notice::new(Audience::Actor, Template::TemporarilyUnavailable)
                    .with("reason", err.to_string())
            }
            _ => {
                warn!(
                    session = %event.session_id,
                    actor = %event.actor.id,
                    error = %err,
                    "event rejected"
                );
                Notice::new(Audience::Actor, Template::ActionRejected)
                    .with("kind", rejection_kind(err))
                    .with("reason", err.to_string())
            }
        };

        let addressing = Addressing::for_actor(event.session_id, event.actor.id);
        self.dispatcher.dispatch(&addressing, vec![notice]).await;
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<Deal>, EscrowError> {
        let deals = Arc::clone(&self.deals);
        Ok(bounded(self.settings.storage_timeout, move || deals.get(session_id)).await?)
    }

    async fn last_receipt(&self, session_id: SessionId) -> Result<Option<Receipt>, EscrowError> {
        let deals = Arc::clone(&self.deals);
        Ok(bounded(self.settings.storage_timeout, move || deals.receipt(session_id)).await?)
    }

    async fn swap(
        &self,
        session_id: SessionId,
        expected: Option<Deal>,
        new: Option<Deal>,
        receipt: Receipt,
    ) -> Result<Result<(), CasConflict>, EscrowError> {
        let deals = Arc::clone(&self.deals);
        Ok(bounded(self.settings.storage_timeout, move || {
            deals.compare_and_swap(session_id, expected.as_ref(), new.as_ref(), &receipt)
        })
        .await?)
    }
}

/// Check that `actor` may take the role `action` needs on this session.
fn authorize(
    session_id: SessionId,
    deal: Option<&Deal>,
    actor: &Actor,
    action: &Action,
    arbiter: &Arbiter,
) -> Result<(), EscrowError> {
    let deal = match deal {
        Some(deal) => deal,
        None if matches!(action, Action::SubmitAddress { .. }) => return Ok(()),
        None => return Err(EscrowError::NoSuchDeal(session_id)),
    };

    let role = action.role();
    let allowed = match role {
        Role::Admin => actor.id == arbiter.id,
        Role::Buyer => match deal.buyer_id {
            Some(buyer) => buyer == actor.id,
            None => matches!(action, Action::SubmitAddress { .. }),
        },
        Role::Seller => match deal.seller_id {
            Some(seller) => seller == actor.id,
            None => matches!(action, Action::SubmitAccount { .. }) && !deal.is_buyer(actor.id),
        },
        Role::Participant => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(EscrowError::Unauthorized {
            actor: actor.id,
            role,
        })
    }
}

fn mint_reference(session_id: SessionId) -> String {
    new_deal_reference().unwrap_or_else(|err| {
        warn!(session = %session_id, error = %err, "could not mint deal reference");
        format!("deal-{session_id}")
    })
}

fn rejection_kind(err: &EscrowError) -> &'static str {
    match err {
        EscrowError::NoSuchDeal(_) => "no_such_deal",
        EscrowError::Unauthorized { .. } => "unauthorized",
        EscrowError::InvalidTransition { .. } => "invalid_transition",
        EscrowError::StorageUnavailable(_) => "storage_unavailable",
    }
}
