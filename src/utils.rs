//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

const DEAL_HRP: &str = "deal";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Human-quotable reference for a new deal, e.g. `deal1qyq…`.
pub fn new_deal_reference() -> anyhow::Result<String> {
    new_uuid_to_bech32(DEAL_HRP)
}
