//! Line-oriented stand-in for the chat platform.
//!
//! Each input line carries one event: `<session_id> <actor_id> <display_name> <command> [args…]`,
//! using the bot's slash commands. Outbound messages are written as JSON
//! lines; turning templates into text is the real gateway's business.
use crate::action::{
    Action, Actor, Command, DeliveryOutcome, Inbound, PaymentOutcome, ReceiptOutcome,
    ReleaseOutcome,
};
use crate::deal::SessionId;
use crate::dispatcher::{Gateway, Outbound};
use crate::router::SessionRouter;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const SESSION_QUEUE_DEPTH: usize = 64;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected '<session_id> <actor_id> <display_name> <command> [args]'")]
    Malformed,
    #[error("'{0}' is not a valid id")]
    BadId(String),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("{0} needs an argument")]
    MissingArgument(&'static str),
    #[error("{command} expects one of {expected}")]
    BadChoice {
        command: &'static str,
        expected: &'static str,
    },
}

pub fn parse_line(line: &str) -> Result<Inbound, ParseError> {
    let mut parts = line.split_whitespace();
    let (Some(session), Some(actor), Some(name), Some(command)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::Malformed);
    };

    let session_id = parse_id(session)?;
    let actor = Actor::new(parse_id(actor)?, name.replace('_', " "));
    let rest = parts.collect::<Vec<_>>().join(" ");

    let command = match command {
        "/start" => Command::Start,
        "/howitworks" => Command::HowItWorks,
        "/contact" | "/dispute" => Command::ContactAdmin,
        "/status" => Command::QueryStatus,
        "/deals" => Command::ListOpenDeals,
        "/language" => Command::SetLanguage(required("/language", rest)?),
        "/buyer" => Command::Deal(Action::SubmitAddress {
            address: required("/buyer", rest)?,
            display_name: actor.display_name.clone(),
        }),
        "/seller" => Command::Deal(Action::SubmitAccount {
            account: required("/seller", rest)?,
            display_name: actor.display_name.clone(),
        }),
        "/paid" => Command::Deal(Action::AttestPaymentSent),
        "/payment" => Command::Deal(Action::ConfirmPayment(
            match choice("/payment", &rest, "confirm|reject")? {
                true => PaymentOutcome::Confirmed,
                false => PaymentOutcome::Rejected,
            },
        )),
        "/delivered" => Command::Deal(Action::AttestDelivery(
            match choice("/delivered", &rest, "yes|no")? {
                true => DeliveryOutcome::Delivered,
                false => DeliveryOutcome::NotDelivered,
            },
        )),
        "/confirm" => Command::Deal(Action::BuyerConfirmReceipt(receipt("/confirm", &rest)?)),
        "/release" => Command::Deal(Action::AdminRelease(
            match choice("/release", &rest, "yes|no")? {
                true => ReleaseOutcome::Release,
                false => ReleaseOutcome::Stop,
            },
        )),
        "/settled" => Command::Deal(Action::SellerConfirmReceipt(receipt("/settled", &rest)?)),
        "/cancel" => Command::Deal(Action::Cancel),
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };

    Ok(Inbound {
        session_id: SessionId(session_id),
        actor,
        command,
    })
}

fn parse_id(raw: &str) -> Result<i64, ParseError> {
    raw.parse().map_err(|_| ParseError::BadId(raw.to_string()))
}

fn required(command: &'static str, rest: String) -> Result<String, ParseError> {
    if rest.is_empty() {
        return Err(ParseError::MissingArgument(command));
    }
    Ok(rest)
}

// yes/confirm -> true, no/reject -> false
fn choice(command: &'static str, rest: &str, expected: &'static str) -> Result<bool, ParseError> {
    match rest {
        "yes" | "confirm" => Ok(true),
        "no" | "reject" => Ok(false),
        _ => Err(ParseError::BadChoice { command, expected }),
    }
}

fn receipt(command: &'static str, rest: &str) -> Result<ReceiptOutcome, ParseError> {
    Ok(match choice(command, rest, "yes|no")? {
        true => ReceiptOutcome::Received,
        false => ReceiptOutcome::NotReceived,
    })
}

/// Feed every event read from `input` to `router` and return how many were accepted.
///
/// Each session gets its own worker that handles that session's events strictly in arrival
/// order; different sessions run concurrently. Returns once input is exhausted and every worker
/// has drained its queue.
pub async fn serve<R>(router: Arc<SessionRouter>, input: R) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut queues: HashMap<SessionId, mpsc::Sender<Inbound>> = HashMap::new();
    let mut workers = JoinSet::new();
    let mut accepted = 0;

    while let Some(line) = lines.next_line().await.context("read input")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let event = match parse_line(line) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "ignoring input line");
                continue;
            }
        };

        let queue = queues.entry(event.session_id).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(SESSION_QUEUE_DEPTH);
            workers.spawn(drain(Arc::clone(&router), receiver));
            sender
        });
        let session_id = event.session_id;
        if queue.send(event).await.is_err() {
            warn!(session = %session_id, "session worker is gone, dropping event");
            continue;
        }
        accepted += 1;
    }

    // closing the queues lets every worker finish what it has and stop
    drop(queues);
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "session worker panicked");
        }
    }

    Ok(accepted)
}

async fn drain(router: Arc<SessionRouter>, mut queue: mpsc::Receiver<Inbound>) {
    while let Some(event) = queue.recv().await {
        match router.handle(event).await {
            Ok(reply) => info!(?reply, "event handled"),
            Err(err) => info!(error = %err, "event refused"),
        }
    }
}

/// Writes every outbound message as one JSON line.
pub struct ConsoleGateway<W> {
    out: Mutex<W>,
}

impl<W> ConsoleGateway<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> Gateway for ConsoleGateway<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&self, message: &Outbound) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}
