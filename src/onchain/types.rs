//! On-chain value types shared by the adapter, classifier and monitors.

use alloy::primitives::{Address, Bytes, B256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::onchain::abi;

/// A transaction addressed to (or candidate for) the monitored contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTx {
    pub hash: B256,
    pub block_number: u64,
    /// Unix seconds of the including block.
    pub block_timestamp: u64,
    pub from: Option<Address>,
    /// `None` for contract creations.
    pub to: Option<Address>,
    pub input: Bytes,
}

/// Receipt fields the monitor needs. `status` is `None` when the provider
/// returned a receipt we could not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: B256,
    pub status: Option<bool>,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<u64>,
    pub gas_used: u64,
}

/// Decoded arguments of `withdraw(uint256,address,uint256,uint8,bytes32,bytes32)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawParams {
    pub id: U256,
    pub trader: Address,
    pub amount: U256,
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

impl WithdrawParams {
    /// Canonical call data: selector followed by the six head words.
    pub fn encode_call(&self) -> Bytes {
        let mut data = Vec::with_capacity(4 + abi::WITHDRAW_ARGS * abi::WORD);
        data.extend_from_slice(&abi::WITHDRAW_SELECTOR);
        data.extend_from_slice(&abi::u256_word(self.id));
        data.extend_from_slice(&abi::address_word(self.trader));
        data.extend_from_slice(&abi::u256_word(self.amount));
        data.extend_from_slice(&abi::u256_word(U256::from(self.v)));
        data.extend_from_slice(self.r.as_slice());
        data.extend_from_slice(self.s.as_slice());
        Bytes::from(data)
    }
}

/// A raw on-chain balance together with the token's decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAmount {
    pub value: U256,
    pub decimals: u8,
}

impl RawAmount {
    pub fn new(value: U256, decimals: u8) -> Self {
        Self { value, decimals }
    }

    /// Human-unit value. `None` if it does not fit a `Decimal`.
    pub fn to_decimal(&self) -> Option<Decimal> {
        scale_amount(self.value, self.decimals)
    }
}

/// Convert a base-unit integer into a human-unit `Decimal`.
///
/// `Decimal` carries a 96-bit mantissa and at most 28 fractional digits, so
/// excess precision is truncated before scaling.
pub fn scale_amount(value: U256, decimals: u8) -> Option<Decimal> {
    let mut value = value;
    let mut scale = u32::from(decimals);
    while scale > 28 {
        value /= U256::from(10u8);
        scale -= 1;
    }
    let raw: u128 = value.try_into().ok()?;
    let mut raw = i128::try_from(raw).ok()?;
    loop {
        if let Ok(d) = Decimal::try_from_i128_with_scale(raw, scale) {
            return Some(d.normalize());
        }
        if scale == 0 {
            return None;
        }
        // Mantissa too wide: drop a fractional digit and retry.
        raw /= 10;
        scale -= 1;
    }
}

/// Lowercase 0x-prefixed hex for display and explorer links.
pub fn hex_hash(hash: &B256) -> String {
    format!("{hash:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_scale_amount_18_decimals() {
        let wei = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(scale_amount(wei, 18), Some(Decimal::from_str("1.5").unwrap()));
    }

    #[test]
    fn test_scale_amount_six_decimals() {
        let raw = RawAmount::new(U256::from(8_500_000_000u64), 6);
        assert_eq!(raw.to_decimal(), Some(Decimal::from(8500)));
    }

    #[test]
    fn test_scale_amount_overflow() {
        assert_eq!(scale_amount(U256::MAX, 0), None);
    }
}
