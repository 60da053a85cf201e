//! Merkle commitment over model weight chunks
//!
//! Nodes are lowercase hex SHA-256 digests and hashing operates on their text:
//!
//! - leaf layer: `sha256(leaf.as_bytes())` for every leaf string
//! - parent: `sha256(left_hex + right_hex)`
//! - an odd layer pairs its last node with itself
//! - the root of an empty tree is `sha256("")`
//!
//! For weight commitments the leaf strings are themselves the hex digests of
//! fixed-size file chunks, so every chunk is hashed twice before pairing.
//! The concatenation order in [`verify_proof`] is load-bearing.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::sha256_hex;

/// Chunk size for weight commitments (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("leaf index {index} out of range for {leaf_count} leaves")]
    IndexOutOfRange { index: usize, leaf_count: usize },
}

/// Which side of the running hash a sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One level of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub side: Side,
}

/// Merkle tree keeping every layer so proofs can be produced
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `layers[0]` holds hashed leaves, the last layer holds the root.
    /// Layers are stored unpadded.
    layers: Vec<Vec<String>>,
}

fn hash_pair(left: &str, right: &str) -> String {
    let mut combined = String::with_capacity(left.len() + right.len());
    combined.push_str(left);
    combined.push_str(right);
    sha256_hex(combined.as_bytes())
}

impl MerkleTree {
    pub fn from_leaves<I, S>(leaves: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let first: Vec<String> = leaves
            .into_iter()
            .map(|leaf| sha256_hex(leaf.as_ref().as_bytes()))
            .collect();

        if first.is_empty() {
            return Self { layers: Vec::new() };
        }

        let mut layers = vec![first];
        while let Some(current) = layers.last().filter(|layer| layer.len() > 1) {
            let next = current
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    let right = pair.get(1).unwrap_or(left);
                    hash_pair(left, right)
                })
                .collect();
            layers.push(next);
        }

        Self { layers }
    }

    pub fn root(&self) -> String {
        self.layers
            .last()
            .and_then(|layer| layer.first())
            .cloned()
            .unwrap_or_else(|| sha256_hex(b""))
    }

    pub fn leaf_count(&self) -> usize {
        self.layers.first().map_or(0, Vec::len)
    }

    /// Hashed leaf at `index`, the starting point for [`verify_proof`]
    pub fn leaf_digest(&self, index: usize) -> Option<&str> {
        self.layers
            .first()
            .and_then(|layer| layer.get(index))
            .map(String::as_str)
    }

    /// Inclusion proof from leaf `index` up to (excluding) the root
    pub fn proof(&self, index: usize) -> Result<Vec<ProofStep>, MerkleError> {
        let leaf_count = self.leaf_count();
        if index >= leaf_count {
            return Err(MerkleError::IndexOutOfRange { index, leaf_count });
        }

        let mut steps = Vec::with_capacity(self.layers.len().saturating_sub(1));
        let mut index = index;

        for layer in &self.layers[..self.layers.len() - 1] {
            let step = if index % 2 == 0 {
                // A trailing odd node is paired with itself
                let sibling = layer.get(index + 1).unwrap_or(&layer[index]);
                ProofStep {
                    sibling: sibling.clone(),
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    sibling: layer[index - 1].clone(),
                    side: Side::Left,
                }
            };
            steps.push(step);
            index /= 2;
        }

        Ok(steps)
    }
}

/// Check an inclusion proof against an expected root
pub fn verify_proof(leaf_digest: &str, proof: &[ProofStep], expected_root: &str) -> bool {
    let computed = proof
        .iter()
        .fold(leaf_digest.to_string(), |current, step| match step.side {
            Side::Left => hash_pair(&step.sibling, &current),
            Side::Right => hash_pair(&current, &step.sibling),
        });
    computed == expected_root
}

/// Hex digests of consecutive `chunk_size` chunks of a reader
pub fn chunk_digests<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<Vec<String>> {
    let chunk_size = chunk_size.max(1);
    let mut digests = Vec::new();
    let mut buf = vec![0u8; chunk_size];

    loop {
        // Fill the whole chunk; only the final one may be short
        let mut filled = 0;
        while filled < chunk_size {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            break;
        }
        digests.push(sha256_hex(&buf[..filled]));
        if filled < chunk_size {
            break;
        }
    }

    Ok(digests)
}

/// Merkle tree over the chunk digests of a reader
pub fn weight_tree<R: Read>(reader: R, chunk_size: usize) -> io::Result<MerkleTree> {
    Ok(MerkleTree::from_leaves(chunk_digests(reader, chunk_size)?))
}

/// Merkle root over the weight chunks of a model file
pub fn merkle_root(path: impl AsRef<Path>, chunk_size: usize) -> io::Result<String> {
    Ok(weight_tree(File::open(path)?, chunk_size)?.root())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree_root() {
        let tree = MerkleTree::from_leaves(Vec::<String>::new());
        assert_eq!(tree.root(), sha256_hex(b""));
        assert_eq!(tree.leaf_count(), 0);
        assert!(tree.proof(0).is_err());
    }

    #[test]
    fn test_single_leaf_root_is_hashed_leaf() {
        let tree = MerkleTree::from_leaves(["a"]);
        assert_eq!(tree.root(), sha256_hex(b"a"));
        assert!(tree.proof(0).unwrap().is_empty());
    }

    #[test]
    fn test_two_leaves_concatenate_hex() {
        let tree = MerkleTree::from_leaves(["a", "b"]);
        let expected = sha256_hex(format!("{}{}", sha256_hex(b"a"), sha256_hex(b"b")).as_bytes());
        assert_eq!(tree.root(), expected);
    }

    #[test]
    fn test_odd_layer_duplicates_last_node() {
        let tree = MerkleTree::from_leaves(["a", "b", "c"]);
        let (ha, hb, hc) = (sha256_hex(b"a"), sha256_hex(b"b"), sha256_hex(b"c"));
        let left = hash_pair(&ha, &hb);
        let right = hash_pair(&hc, &hc);
        assert_eq!(tree.root(), hash_pair(&left, &right));

        // The duplicated node is its own sibling
        let proof = tree.proof(2).unwrap();
        assert_eq!(proof[0].sibling, hc);
        assert_eq!(proof[0].side, Side::Right);
        assert_eq!(proof[1].sibling, left);
        assert_eq!(proof[1].side, Side::Left);
    }

    #[test]
    fn test_every_proof_verifies() {
        let leaves: Vec<String> = (0..7).map(|i| format!("leaf-{i}")).collect();
        let tree = MerkleTree::from_leaves(&leaves);
        let root = tree.root();

        for i in 0..leaves.len() {
            let proof = tree.proof(i).unwrap();
            assert!(verify_proof(tree.leaf_digest(i).unwrap(), &proof, &root));
        }
    }

    #[test]
    fn test_swapped_side_fails() {
        let tree = MerkleTree::from_leaves(["a", "b"]);
        let mut proof = tree.proof(0).unwrap();
        proof[0].side = Side::Left;
        assert!(!verify_proof(tree.leaf_digest(0).unwrap(), &proof, &tree.root()));
    }

    #[test]
    fn test_chunking() {
        let data = vec![7u8; 10];
        let digests = chunk_digests(&data[..], 4).unwrap();
        assert_eq!(digests.len(), 3);
        assert_eq!(digests[2], sha256_hex(&[7u8; 2]));

        assert!(chunk_digests(&b""[..], 4).unwrap().is_empty());
        assert_eq!(chunk_digests(&data[..5], 5).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_file_root() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            merkle_root(file.path(), DEFAULT_CHUNK_SIZE).unwrap(),
            sha256_hex(b"")
        );
    }
}
