//! Core value types: hashes, height ranges, transactions, and the facts the
//! external validator hands to the pool.
//!
//! The pool never verifies signatures or proofs. Inputs and outputs are
//! opaque commitments; kernels carry the fee, validity window, and metered
//! contract charge of each component.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransactionError;

/// Amount in the smallest currency unit.
pub type Amount = u64;

/// Block height.
pub type Height = u64;

/// A 32-byte hash value.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// BLAKE3 hash of arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Conflict key: identifies the set of outputs a transaction consumes.
///
/// Two transactions with the same key are mutually exclusive.
pub type TxKey = Hash256;

/// Hash of the execution context a dependent transaction was validated on
/// (or produces, once applied).
pub type ContextHash = Hash256;

/// Inclusive range of heights at which a transaction may be mined.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct HeightRange {
    pub min: Height,
    pub max: Height,
}

impl Default for HeightRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl HeightRange {
    /// Every height.
    pub const FULL: Self = Self { min: 0, max: Height::MAX };

    pub fn new(min: Height, max: Height) -> Self {
        Self { min, max }
    }

    /// A range containing no heights.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, height: Height) -> bool {
        self.min <= height && height <= self.max
    }

    /// Narrow this range to its overlap with `other`. May become empty.
    pub fn intersect(&mut self, other: &HeightRange) {
        self.min = self.min.max(other.min);
        self.max = self.max.min(other.max);
    }

    /// Overlap of two ranges, without mutating either.
    pub fn intersection(&self, other: &HeightRange) -> HeightRange {
        let mut hr = *self;
        hr.intersect(other);
        hr
    }
}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// A transaction kernel: fee, validity window, and contract charge.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct TxKernel {
    /// Fee paid by this kernel.
    pub fee: Amount,
    /// Lowest height at which the kernel may be mined.
    pub min_height: Height,
    /// Highest height at which the kernel may be mined.
    pub max_height: Height,
    /// Metered contract execution cost (zero for plain transfers).
    pub bvm_charge: u32,
    /// Distinguishes otherwise identical kernels.
    pub nonce: u64,
}

impl TxKernel {
    pub fn height_range(&self) -> HeightRange {
        HeightRange::new(self.min_height, self.max_height)
    }
}

/// An unconfirmed transaction as seen by the pool.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Commitments of the outputs this transaction consumes.
    pub inputs: Vec<Hash256>,
    /// Commitments of the outputs this transaction creates.
    pub outputs: Vec<Hash256>,
    /// Kernels; at least one.
    pub kernels: Vec<TxKernel>,
    /// Blinding offset.
    pub offset: Hash256,
}

impl Transaction {
    /// Canonical bincode encoding (standard config).
    pub fn encode(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Transaction ID: BLAKE3 of the canonical encoding.
    pub fn id(&self) -> Result<Hash256, TransactionError> {
        Ok(Hash256::digest(&self.encode()?))
    }

    /// Serialized size in bytes, without any correction.
    pub fn size_netto(&self) -> Result<usize, TransactionError> {
        Ok(self.encode()?.len())
    }

    /// Conflict key: BLAKE3 over the sorted input commitments.
    ///
    /// Independent of input order, outputs and kernels, so any two
    /// transactions spending the same set of outputs collide.
    pub fn key(&self) -> TxKey {
        let mut inputs = self.inputs.clone();
        inputs.sort_unstable();
        let mut hasher = blake3::Hasher::new();
        for input in &inputs {
            hasher.update(input.as_bytes());
        }
        Hash256(hasher.finalize().into())
    }

    /// Whether the two transactions spend or create any common output.
    pub fn overlaps(&self, other: &Transaction) -> bool {
        self.inputs.iter().any(|i| other.inputs.contains(i))
            || self.outputs.iter().any(|o| other.outputs.contains(o))
    }

    /// Combine two transactions into one carrying both sets of inputs,
    /// outputs and kernels, each sorted.
    ///
    /// Does not check compatibility; see [`overlaps`](Self::overlaps).
    pub fn combine(&self, other: &Transaction) -> Transaction {
        let mut inputs: Vec<Hash256> = self.inputs.iter().chain(&other.inputs).copied().collect();
        let mut outputs: Vec<Hash256> = self.outputs.iter().chain(&other.outputs).copied().collect();
        let mut kernels: Vec<TxKernel> = self.kernels.iter().chain(&other.kernels).cloned().collect();
        inputs.sort_unstable();
        outputs.sort_unstable();
        kernels.sort_unstable();

        let mut offset = [0u8; 64];
        offset[..32].copy_from_slice(self.offset.as_bytes());
        offset[32..].copy_from_slice(other.offset.as_bytes());

        Transaction {
            inputs,
            outputs,
            kernels,
            offset: Hash256::digest(&offset),
        }
    }
}

/// Facts produced by successful context-dependent validation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxContext {
    /// Total fee across kernels.
    pub fee: Amount,
    /// Heights at which every kernel is valid.
    pub height: HeightRange,
    /// Total metered contract charge.
    pub bvm_charge: u32,
}

impl TxContext {
    /// Summarize the kernels of `tx`: sum fees and charges, intersect ranges.
    pub fn summarize(tx: &Transaction) -> Result<Self, TransactionError> {
        if tx.kernels.is_empty() {
            return Err(TransactionError::NoKernels);
        }

        let mut fee: Amount = 0;
        let mut bvm_charge: u32 = 0;
        let mut height = HeightRange::FULL;
        for kernel in &tx.kernels {
            fee = fee.checked_add(kernel.fee).ok_or(TransactionError::FeeOverflow)?;
            bvm_charge = bvm_charge
                .checked_add(kernel.bvm_charge)
                .ok_or(TransactionError::ChargeOverflow)?;
            height.intersect(&kernel.height_range());
        }

        if height.is_empty() {
            return Err(TransactionError::EmptyHeightRange);
        }

        Ok(Self { fee, height, bvm_charge })
    }
}
