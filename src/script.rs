//! Lock script templates
//!
//! Outputs are locked by one of a small set of standard templates. The
//! ledger never executes scripts; it classifies them and checks that the
//! spending key matches the committed key or key hash.

use crate::constants::MAX_SCRIPT_SIZE;
use crate::crypto::hash160;
use crate::types::ByteString;

pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Maximum payload of a data-carrier output
pub const MAX_NULL_DATA: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    /// OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    PayToPublicKeyHash,
    /// <33|65> OP_CHECKSIG
    PayToPublicKey,
    /// OP_RETURN <data>, provably unspendable
    NullData,
    NonStandard,
}

/// Lock script paying to HASH160(public_key)
pub fn p2pkh_script(public_key: &[u8]) -> ByteString {
    p2pkh_script_from_hash(&hash160(public_key))
}

pub fn p2pkh_script_from_hash(key_hash: &[u8; 20]) -> ByteString {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(key_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn null_data_script(data: &[u8]) -> ByteString {
    let mut script = Vec::with_capacity(data.len() + 2);
    script.push(OP_RETURN);
    script.push(data.len() as u8);
    script.extend_from_slice(data);
    script
}

/// Classify: 𝒮𝒞 → {p2pkh, p2pk, null-data, non-standard}
pub fn classify(script: &[u8]) -> ScriptType {
    if script.len() > MAX_SCRIPT_SIZE {
        return ScriptType::NonStandard;
    }

    match script {
        [OP_DUP, OP_HASH160, 20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            ScriptType::PayToPublicKeyHash
        }
        [len, key @ .., OP_CHECKSIG]
            if (*len == 33 || *len == 65) && key.len() == *len as usize =>
        {
            ScriptType::PayToPublicKey
        }
        [OP_RETURN] => ScriptType::NullData,
        [OP_RETURN, len, data @ ..]
            if data.len() == *len as usize && data.len() <= MAX_NULL_DATA =>
        {
            ScriptType::NullData
        }
        _ => ScriptType::NonStandard,
    }
}

pub fn is_standard(script: &[u8]) -> bool {
    classify(script) != ScriptType::NonStandard
}

/// Whether an output locked by `script` may be spent at all
pub fn is_spendable(script: &[u8]) -> bool {
    matches!(
        classify(script),
        ScriptType::PayToPublicKeyHash | ScriptType::PayToPublicKey
    )
}

/// Whether `public_key` is the key committed to by `script`
pub fn script_matches_key(script: &[u8], public_key: &[u8]) -> bool {
    match classify(script) {
        ScriptType::PayToPublicKeyHash => script[3..23] == hash160(public_key),
        ScriptType::PayToPublicKey => &script[1..script.len() - 1] == public_key,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p2pkh_roundtrip() {
        let pk = [0x02; 33];
        let script = p2pkh_script(&pk);
        assert_eq!(script.len(), 25);
        assert_eq!(classify(&script), ScriptType::PayToPublicKeyHash);
        assert!(script_matches_key(&script, &pk));
        assert!(!script_matches_key(&script, &[0x03; 33]));
    }

    #[test]
    fn test_p2pk() {
        let mut script = vec![33];
        script.extend_from_slice(&[0x02; 33]);
        script.push(OP_CHECKSIG);
        assert_eq!(classify(&script), ScriptType::PayToPublicKey);
        assert!(script_matches_key(&script, &[0x02; 33]));
    }

    #[test]
    fn test_null_data_is_standard_but_unspendable() {
        let script = null_data_script(b"hello");
        assert!(is_standard(&script));
        assert!(!is_spendable(&script));
    }

    #[test]
    fn test_non_standard() {
        assert!(!is_standard(&[]));
        assert!(!is_standard(&[0x51]));
        let mut truncated = p2pkh_script(&[0x02; 33]);
        truncated.pop();
        assert!(!is_standard(&truncated));
    }
}
