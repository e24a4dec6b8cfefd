//! Completion proofs: per-segment receipts and the claims that batch them.

use crate::job::JobId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 digest of a segment or of a set of digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Fingerprint raw segment bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Fingerprint an ordered list of fingerprints.
    ///
    /// A single element is returned unchanged so single-profile jobs carry
    /// the plain output hash.
    pub fn combine(parts: &[Fingerprint]) -> Self {
        if let [single] = parts {
            return *single;
        }
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&part.0);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..16])
    }
}

/// Proof of one completed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeReceipt {
    /// Source segment sequence number.
    pub seq: u64,
    /// Fingerprint of the source segment.
    pub input: Fingerprint,
    /// Fingerprint of the transcoded output(s).
    pub output: Fingerprint,
}

impl TranscodeReceipt {
    /// Merkle leaf for this receipt: `BLAKE3(seq_le || input || output)`.
    pub fn leaf(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seq.to_le_bytes());
        hasher.update(&self.input.0);
        hasher.update(&self.output.0);
        Fingerprint(*hasher.finalize().as_bytes())
    }
}

/// Binary Merkle root over ordered leaves.
///
/// An odd trailing node is promoted unchanged. Returns `None` for no leaves.
pub fn merkle_root(leaves: &[Fingerprint]) -> Option<Fingerprint> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = blake3::Hasher::new();
                    hasher.update(&left.0);
                    hasher.update(&right.0);
                    Fingerprint(*hasher.finalize().as_bytes())
                }
                odd => odd[0],
            })
            .collect();
    }
    level.first().copied()
}

/// Lifecycle of a claim after it was cut.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    /// Cut but not yet accepted by the chain.
    Pending,
    /// Accepted by the chain.
    Submitted {
        /// Attempts it took, including the successful one.
        attempts: u32,
    },
    /// Gave up; the range is discarded.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Last error.
        reason: String,
    },
}

/// Batch of receipts covering a contiguous sequence range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Job the work belongs to.
    pub job_id: JobId,
    /// First sequence number (inclusive).
    pub start: u64,
    /// Last sequence number (inclusive).
    pub end: u64,
    /// Merkle root over the receipt leaves.
    pub digest: Fingerprint,
    /// Submission status.
    pub status: ClaimStatus,
}

impl Claim {
    /// Build a pending claim from a contiguous, ordered run of receipts.
    ///
    /// Returns `None` if `receipts` is empty or not contiguous.
    pub fn from_receipts(job_id: JobId, receipts: &[TranscodeReceipt]) -> Option<Self> {
        let first = receipts.first()?;
        let last = receipts.last()?;
        let contiguous = receipts
            .windows(2)
            .all(|w| w[1].seq == w[0].seq + 1);
        if !contiguous {
            return None;
        }
        let leaves: Vec<_> = receipts.iter().map(TranscodeReceipt::leaf).collect();
        Some(Self {
            job_id,
            start: first.seq,
            end: last.seq,
            digest: merkle_root(&leaves)?,
            status: ClaimStatus::Pending,
        })
    }

    /// Number of segments covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a claim covers at least one segment.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether two claims share any sequence number.
    pub fn overlaps(&self, other: &Claim) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(seq: u64) -> TranscodeReceipt {
        TranscodeReceipt {
            seq,
            input: Fingerprint::of(format!("in-{seq}").as_bytes()),
            output: Fingerprint::of(format!("out-{seq}").as_bytes()),
        }
    }

    #[test]
    fn test_combine_single_is_identity() {
        let f = Fingerprint::of(b"segment");
        assert_eq!(Fingerprint::combine(&[f]), f);
        assert_ne!(Fingerprint::combine(&[f, f]), f);
    }

    #[test]
    fn test_merkle_root_shapes() {
        assert!(merkle_root(&[]).is_none());

        let a = receipt(0).leaf();
        assert_eq!(merkle_root(&[a]), Some(a));

        let b = receipt(1).leaf();
        let c = receipt(2).leaf();
        let ab = merkle_root(&[a, b]).unwrap();
        // Odd node is promoted, so [a, b, c] == H(H(a,b), c)
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[ab, c]));
    }

    #[test]
    fn test_claim_from_contiguous_receipts() {
        let receipts: Vec<_> = (3..=7).map(receipt).collect();
        let claim = Claim::from_receipts(JobId::from(9u64), &receipts).unwrap();
        assert_eq!((claim.start, claim.end), (3, 7));
        assert_eq!(claim.len(), 5);
        assert_eq!(claim.status, ClaimStatus::Pending);
    }

    #[test]
    fn test_claim_rejects_empty_or_gapped() {
        assert!(Claim::from_receipts(JobId::from(1u64), &[]).is_none());
        let gapped = vec![receipt(0), receipt(2)];
        assert!(Claim::from_receipts(JobId::from(1u64), &gapped).is_none());
    }

    #[test]
    fn test_digest_depends_on_content() {
        let a = Claim::from_receipts(JobId::from(1u64), &[receipt(0)]).unwrap();
        let mut altered = receipt(0);
        altered.output = Fingerprint::of(b"tampered");
        let b = Claim::from_receipts(JobId::from(1u64), &[altered]).unwrap();
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_overlaps() {
        let a = Claim::from_receipts(JobId::from(1u64), &[receipt(0), receipt(1)]).unwrap();
        let b = Claim::from_receipts(JobId::from(1u64), &[receipt(1), receipt(2)]).unwrap();
        let c = Claim::from_receipts(JobId::from(1u64), &[receipt(2)]).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
