pub mod action;
pub mod cli;
pub mod config;
pub mod console;
pub mod deal;
pub mod dispatcher;
pub mod error;
pub mod machine;
pub mod memory_store;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use action::{Action, Actor, Command, Inbound, Role};
pub use deal::{Deal, DealSummary, PartyId, SessionId, Stage};
pub use error::EscrowError;
pub use router::{Reply, SessionRouter};
