//! Classifies candidate transactions against the monitored withdraw call.

use alloy::primitives::{Address, B256};

use crate::onchain::abi;
use crate::onchain::types::{CandidateTx, WithdrawParams};

/// Outcome of classifying one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Not a withdraw call on the monitored contract.
    NotAMatch,
    /// Withdraw call with fully decoded arguments.
    Matched(WithdrawParams),
    /// Selector matched but the arguments could not be decoded. The call is
    /// still tracked and alertable, only without amount detail.
    MatchedUndecodable(String),
}

impl Classification {
    pub fn is_match(&self) -> bool {
        !matches!(self, Classification::NotAMatch)
    }
}

/// Classify `tx` for the contract at `monitored`.
///
/// `Address` equality is byte equality, which is what a case-insensitive
/// comparison of the hex renderings amounts to.
pub fn classify(monitored: Address, tx: &CandidateTx) -> Classification {
    if tx.to != Some(monitored) {
        return Classification::NotAMatch;
    }
    classify_input(&tx.input)
}

/// Classify raw call data, ignoring the destination.
pub fn classify_input(input: &[u8]) -> Classification {
    if input.len() < 4 || input[..4] != abi::WITHDRAW_SELECTOR {
        return Classification::NotAMatch;
    }

    match decode_withdraw_args(&input[4..]) {
        Ok(params) => Classification::Matched(params),
        Err(reason) => Classification::MatchedUndecodable(reason),
    }
}

/// Decode the six static head words. Trailing bytes are tolerated, as the EVM does.
fn decode_withdraw_args(args: &[u8]) -> Result<WithdrawParams, String> {
    let needed = abi::WITHDRAW_ARGS * abi::WORD;
    if args.len() < needed {
        return Err(format!(
            "call data too short: {} argument bytes, need {}",
            args.len(),
            needed
        ));
    }

    // Length was checked above, so every head word is present.
    let w = |i: usize| abi::word(args, i).ok_or_else(|| format!("missing word {i}"));

    let id = abi::word_to_u256(&w(0)?);
    let trader = abi::word_to_address(&w(1)?)
        .ok_or_else(|| "trader word has non-zero padding".to_string())?;
    let amount = abi::word_to_u256(&w(2)?);
    let v = abi::word_to_u8(&w(3)?).ok_or_else(|| "v does not fit uint8".to_string())?;
    let r = B256::from(w(4)?);
    let s = B256::from(w(5)?);

    Ok(WithdrawParams {
        id,
        trader,
        amount,
        v,
        r,
        s,
    })
}
