//! Core ledger types
//!
//! Byte blobs serialize as lowercase hex and amounts as decimal strings so
//! stored JSON records stay readable and lossless for large integers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::double_sha256;
use crate::merkle::MerkleProof;

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Amount in base units
pub type Amount = u128;

/// Block height
pub type Height = u64;

/// Seconds since the Unix epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Amounts as decimal strings
pub mod amount_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Optional byte blobs as hex
pub mod opt_hex {
    use hex::{FromHex, ToHex};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: ToHex,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&bytes.encode_hex::<String>()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromHex,
        T::Error: Display,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| T::from_hex(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// OutPoint: 𝒪 = ℍ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    #[serde(with = "hex")]
    pub tx_id: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: Hash, index: u32) -> Self {
        Self { tx_id, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.tx_id), self.index)
    }
}

/// Fixed currency descriptor carried by every output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            name: "Quadratic Vote Coin".to_string(),
            symbol: "QVC".to_string(),
            decimals: 8,
        }
    }
}

/// Unspent transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    #[serde(with = "hex")]
    pub tx_id: Hash,
    pub output_index: u32,
    #[serde(with = "amount_serde")]
    pub amount: Amount,
    pub address: String,
    #[serde(with = "hex")]
    pub script: ByteString,
    #[serde(with = "hex")]
    pub public_key: ByteString,
    #[serde(default, with = "opt_hex")]
    pub signature: Option<ByteString>,
    pub spent: bool,
    pub timestamp: u64,
    #[serde(default)]
    pub block_height: Option<Height>,
    #[serde(default, with = "opt_hex")]
    pub merkle_root: Option<Hash>,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub currency: Currency,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_id, self.output_index)
    }

    /// Confirmation depth as seen at `height`; unconfirmed outputs fall back
    /// to the recorded counter.
    pub fn confirmations_at(&self, height: Height) -> u64 {
        match self.block_height {
            Some(h) if height >= h => height - h + 1,
            Some(_) => 0,
            None => self.confirmations,
        }
    }

    /// Canonical tuple committed to by the set's Merkle root and signature.
    /// Excludes fields assigned after insertion.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(&self.tx_id);
        bytes.extend_from_slice(&self.output_index.to_le_bytes());
        bytes.extend_from_slice(&self.amount.to_le_bytes());
        put_bytes(&mut bytes, self.address.as_bytes());
        put_bytes(&mut bytes, &self.script);
        put_bytes(&mut bytes, &self.public_key);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.block_height.unwrap_or(u64::MAX).to_le_bytes());
        bytes
    }
}

/// Transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Standard,
    Coinbase,
    PowReward,
    QuadraticVote,
}

impl TransactionType {
    fn tag(&self) -> u8 {
        match self {
            TransactionType::Standard => 0,
            TransactionType::Coinbase => 1,
            TransactionType::PowReward => 2,
            TransactionType::QuadraticVote => 3,
        }
    }

    /// Reward transactions mint value and carry no inputs
    pub fn is_reward(&self) -> bool {
        matches!(self, TransactionType::Coinbase | TransactionType::PowReward)
    }
}

/// Transaction input: spends `prev_out`, authorised by a signature over the tx id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_out: OutPoint,
    /// Amount the spender claims the referenced output holds
    #[serde(with = "amount_serde")]
    pub amount: Amount,
    #[serde(with = "hex")]
    pub signature: ByteString,
    #[serde(with = "hex")]
    pub public_key: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    #[serde(with = "amount_serde")]
    pub amount: Amount,
    #[serde(with = "hex")]
    pub script: ByteString,
}

/// Proof-of-work datum attached to reward transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowData {
    pub nonce: u64,
    pub difficulty: u32,
    pub timestamp: u64,
    #[serde(with = "hex")]
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteData {
    pub proposal_id: String,
    pub choice: bool,
    pub weight: u64,
}

/// Transaction: 𝒯𝒳 = ℍ × 𝒦 × ℐ* × 𝒯* × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(with = "hex")]
    pub id: Hash,
    pub tx_type: TransactionType,
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(with = "amount_serde")]
    pub fee: Amount,
    pub timestamp: u64,
    #[serde(default)]
    pub pow_data: Option<PowData>,
    #[serde(default)]
    pub vote_data: Option<VoteData>,
}

impl Transaction {
    /// Bytes covered by the id, i.e. everything but the input signatures
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.push(self.tx_type.tag());

        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(&input.prev_out.tx_id);
            bytes.extend_from_slice(&input.prev_out.index.to_le_bytes());
            bytes.extend_from_slice(&input.amount.to_le_bytes());
            put_bytes(&mut bytes, &input.public_key);
        }

        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            put_bytes(&mut bytes, output.address.as_bytes());
            bytes.extend_from_slice(&output.amount.to_le_bytes());
            put_bytes(&mut bytes, &output.script);
        }

        bytes.extend_from_slice(&self.fee.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());

        match &self.pow_data {
            Some(pow) => {
                bytes.push(1);
                bytes.extend_from_slice(&pow.nonce.to_le_bytes());
                bytes.extend_from_slice(&pow.difficulty.to_le_bytes());
                bytes.extend_from_slice(&pow.timestamp.to_le_bytes());
                bytes.extend_from_slice(&pow.hash);
            }
            None => bytes.push(0),
        }

        match &self.vote_data {
            Some(vote) => {
                bytes.push(1);
                put_bytes(&mut bytes, vote.proposal_id.as_bytes());
                bytes.push(vote.choice as u8);
                bytes.extend_from_slice(&vote.weight.to_le_bytes());
            }
            None => bytes.push(0),
        }

        bytes
    }

    /// id = SHA256d(signing bytes)
    pub fn compute_id(&self) -> Hash {
        double_sha256(&self.signing_bytes())
    }

    /// Canonical size in bytes: signing bytes plus signatures
    pub fn size(&self) -> usize {
        self.signing_bytes().len()
            + self.inputs.iter().map(|i| 4 + i.signature.len()).sum::<usize>()
    }

    pub fn is_reward(&self) -> bool {
        self.tx_type.is_reward()
    }

    pub fn output_value(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0u128, |acc, o| acc.checked_add(o.amount))
    }

    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        (0..self.outputs.len() as u32).map(move |i| OutPoint::new(self.id, i))
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

/// Block Header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    #[serde(with = "hex")]
    pub previous_hash: Hash,
    #[serde(with = "hex")]
    pub merkle_root: Hash,
    #[serde(with = "hex")]
    pub validator_merkle_root: Hash,
    pub timestamp: u64,
    /// Required leading zero bits of the block hash
    pub difficulty: u32,
    pub nonce: u64,
    pub height: Height,
}

impl BlockHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(124);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.previous_hash);
        bytes.extend_from_slice(&self.merkle_root);
        bytes.extend_from_slice(&self.validator_merkle_root);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.difficulty.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes
    }
}

/// Governance vote carried in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVote {
    #[serde(with = "hex")]
    pub voter_public_key: ByteString,
    pub proposal_id: String,
    pub choice: bool,
    pub weight: u64,
    #[serde(with = "hex")]
    pub signature: ByteString,
}

impl BlockVote {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        put_bytes(&mut bytes, &self.voter_public_key);
        put_bytes(&mut bytes, self.proposal_id.as_bytes());
        bytes.push(self.choice as u8);
        bytes.extend_from_slice(&self.weight.to_le_bytes());
        bytes
    }
}

/// Validator attestation carried in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub address: String,
    #[serde(with = "hex")]
    pub public_key: ByteString,
    pub reputation: u64,
    /// Signature over the block hash
    #[serde(with = "hex")]
    pub signature: ByteString,
    pub merkle_proof: MerkleProof,
}

impl ValidatorInfo {
    /// Leaf committed to by the header's validator Merkle root
    pub fn leaf_hash(&self) -> Hash {
        validator_leaf_hash(&self.address, &self.public_key, self.reputation)
    }
}

pub fn validator_leaf_hash(address: &str, public_key: &[u8], reputation: u64) -> Hash {
    let mut bytes = Vec::new();
    put_bytes(&mut bytes, address.as_bytes());
    put_bytes(&mut bytes, public_key);
    bytes.extend_from_slice(&reputation.to_le_bytes());
    double_sha256(&bytes)
}

/// Block: ℬ = ℋ × 𝒯𝒳* × 𝒱* × 𝒱𝒜*
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub votes: Vec<BlockVote>,
    #[serde(default)]
    pub validators: Vec<ValidatorInfo>,
}
