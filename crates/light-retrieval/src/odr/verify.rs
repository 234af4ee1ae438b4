//! Response verification: content hashes and receipt Merkle roots.

use sha2::{Digest, Sha256};

use crate::domain::{sha256, Hash};

/// Check that `bytes` hash to `expected`.
pub fn validate_hash(bytes: &[u8], expected: &Hash, what: &str) -> Result<(), String> {
    if bytes.is_empty() {
        return Err(format!("empty {}", what));
    }
    if sha256(bytes) != *expected {
        return Err(format!("{} hash mismatch", what));
    }
    Ok(())
}

fn hash_concat(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle root over leaf hashes. An odd node is paired with itself.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    match leaves {
        [] => [0u8; 32],
        [single] => *single,
        _ => {
            let mut level = leaves.to_vec();
            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|pair| hash_concat(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                    .collect();
            }
            level[0]
        }
    }
}

/// Merkle root committing to a block's receipts.
pub fn receipts_root(receipts: &[Vec<u8>]) -> Hash {
    let leaves: Vec<Hash> = receipts.iter().map(|r| sha256(r)).collect();
    merkle_root(&leaves)
}
