//! Call-data ABI for the monitored `withdraw` function and the two ERC-20
//! views used by the balance checker.
//!
//! We only ever decode one fixed, fully static signature, so the word codec
//! is hand-rolled over 32-byte slots instead of pulling in a general decoder.

use alloy::primitives::{Address, B256, U256};

// ─── Function selectors (first 4 bytes of keccak256 of the signature) ────────

/// Signature of the monitored function.
pub const WITHDRAW_SIGNATURE: &str = "withdraw(uint256,address,uint256,uint8,bytes32,bytes32)";

/// keccak256("withdraw(uint256,address,uint256,uint8,bytes32,bytes32)")[..4]
pub const WITHDRAW_SELECTOR: [u8; 4] = [0x61, 0xc8, 0xe7, 0x39];

/// keccak256("balanceOf(address)")[..4]
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// keccak256("decimals()")[..4]
pub const DECIMALS_SELECTOR: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];

/// Size of one ABI head slot.
pub const WORD: usize = 32;

/// Number of static arguments in the withdraw signature.
pub const WITHDRAW_ARGS: usize = 6;

/// Compute keccak256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Selector for an arbitrary signature string.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Verify that our pre-computed selectors match their signatures.
/// Called at startup; a mismatch is a configuration error.
pub fn verify_selectors() -> Vec<(String, bool)> {
    let checks = [
        (WITHDRAW_SIGNATURE, WITHDRAW_SELECTOR),
        ("balanceOf(address)", BALANCE_OF_SELECTOR),
        ("decimals()", DECIMALS_SELECTOR),
    ];

    checks
        .into_iter()
        .map(|(sig, expected)| (sig.to_string(), selector(sig) == expected))
        .collect()
}

/// Read the `index`-th head word after the selector, if present.
pub fn word(args: &[u8], index: usize) -> Option<[u8; 32]> {
    let start = index * WORD;
    args.get(start..start + WORD)?.try_into().ok()
}

pub fn word_to_u256(word: &[u8; 32]) -> U256 {
    U256::from_be_bytes(*word)
}

/// An address word must be left-padded with 12 zero bytes.
pub fn word_to_address(word: &[u8; 32]) -> Option<Address> {
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

/// A uint8 word must carry its value in the last byte only.
pub fn word_to_u8(word: &[u8; 32]) -> Option<u8> {
    if word[..31].iter().any(|b| *b != 0) {
        return None;
    }
    Some(word[31])
}

pub fn u256_word(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

pub fn address_word(address: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_slice());
    out
}

/// Call data for `balanceOf(holder)`.
pub fn balance_of_call(holder: Address) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&address_word(holder));
    data
}

/// Call data for `decimals()`.
pub fn decimals_call() -> Vec<u8> {
    DECIMALS_SELECTOR.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precomputed_selectors_match() {
        for (sig, ok) in verify_selectors() {
            assert!(ok, "selector mismatch for {sig}");
        }
    }

    #[test]
    fn test_address_word_padding() {
        let addr = Address::repeat_byte(0xab);
        let w = address_word(addr);
        assert_eq!(word_to_address(&w), Some(addr));

        let mut dirty = w;
        dirty[0] = 1;
        assert_eq!(word_to_address(&dirty), None);
    }

    #[test]
    fn test_u8_word_bounds() {
        let w = u256_word(U256::from(27u8));
        assert_eq!(word_to_u8(&w), Some(27));
        let w = u256_word(U256::from(256u32));
        assert_eq!(word_to_u8(&w), None);
    }
}
