//! Fan-out of state machine notices to the messaging gateway
use crate::deal::{Deal, PartyId, SessionId};
use crate::machine::{Audience, Notice, Params, Template};
use crate::store::{PreferenceStore, bounded};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Party(PartyId),
    Session(SessionId),
}

/// One addressed message. The gateway owns turning the template into text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outbound {
    pub recipient: Recipient,
    pub language: String,
    pub template: Template,
    pub params: Params,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn deliver(&self, message: &Outbound) -> anyhow::Result<()>;
}

/// Who the audiences of a notice map to at the time it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    pub session_id: SessionId,
    pub buyer: Option<PartyId>,
    pub seller: Option<PartyId>,
    pub actor: PartyId,
}

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub default_language: String,
    pub attempts: u32,
    pub backoff: Duration,
    pub lookup_timeout: Duration,
}

pub struct Dispatcher {
    gateway: Arc<dyn Gateway>,
    preferences: Arc<dyn PreferenceStore>,
    admin: PartyId,
    policy: DispatchPolicy,
}

impl Addressing {
    pub fn for_deal(deal: &Deal, actor: PartyId) -> Self {
        Self {
            session_id: deal.session_id,
            buyer: deal.buyer_id,
            seller: deal.seller_id,
            actor,
        }
    }

    pub fn for_actor(session_id: SessionId, actor: PartyId) -> Self {
        Self {
            session_id,
            buyer: None,
            seller: None,
            actor,
        }
    }
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        preferences: Arc<dyn PreferenceStore>,
        admin: PartyId,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            gateway,
            preferences,
            admin,
            policy,
        }
    }

    /// Deliver every notice it can. Failures are logged and never reported back: by the time
    /// this runs the deal change is already persisted. Returns how many messages went out.
    pub async fn dispatch(&self, addressing: &Addressing, notices: Vec<Notice>) -> usize {
        let mut delivered = 0;

        for notice in notices {
            let Some(recipient) = self.resolve(notice.audience, addressing) else {
                warn!(
                    session = %addressing.session_id,
                    template = notice.template.key(),
                    "no recipient for {:?} notice, dropping",
                    notice.audience
                );
                continue;
            };

            let outbound = Outbound {
                recipient,
                language: self.language_for(recipient).await,
                template: notice.template,
                params: notice.params,
            };

            if self.deliver_with_retry(&outbound).await {
                delivered += 1;
            }
        }

        delivered
    }

    fn resolve(&self, audience: Audience, addressing: &Addressing) -> Option<Recipient> {
        match audience {
            Audience::Buyer => addressing.buyer.map(Recipient::Party),
            Audience::Seller => addressing.seller.map(Recipient::Party),
            Audience::Admin => Some(Recipient::Party(self.admin)),
            Audience::Actor => Some(Recipient::Party(addressing.actor)),
            Audience::Session => Some(Recipient::Session(addressing.session_id)),
        }
    }

    async fn language_for(&self, recipient: Recipient) -> String {
        let Recipient::Party(party) = recipient else {
            return self.policy.default_language.clone();
        };

        let preferences = Arc::clone(&self.preferences);
        match bounded(self.policy.lookup_timeout, move || preferences.language(party)).await {
            Ok(Some(tag)) => tag,
            Ok(None) => self.policy.default_language.clone(),
            Err(err) => {
                warn!(party = %party, error = %err, "language lookup failed, using default");
                self.policy.default_language.clone()
            }
        }
    }

    async fn deliver_with_retry(&self, outbound: &Outbound) -> bool {
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            match self.gateway.deliver(outbound).await {
                Ok(()) => {
                    debug!(
                        template = outbound.template.key(),
                        attempt, "notification delivered"
                    );
                    return true;
                }
                Err(err) => {
                    warn!(
                        template = outbound.template.key(),
                        attempt,
                        error = %err,
                        "notification delivery failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        false
    }
}
