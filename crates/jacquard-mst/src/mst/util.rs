//! MST utility functions

use std::cmp::Ordering;

use crate::error::{KeyError, MstError, Result};
use crate::{DAG_CBOR_CID_CODEC, SHA2_256_CODE};
use cid::Cid as IpldCid;
use sha2::{Digest, Sha256};

/// Maximum MST key length in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Compute CID from raw bytes
///
/// Uses SHA-256 hash and DAG-CBOR codec. Assumes data is already DAG-CBOR encoded.
pub fn compute_cid(data: &[u8]) -> Result<IpldCid> {
    let hash = Sha256::digest(data);
    let mh = multihash::Multihash::<64>::wrap(SHA2_256_CODE, hash.as_slice())
        .map_err(MstError::serialization)?;

    Ok(IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh))
}

/// Calculate layer (depth) for a key based on its hash
///
/// depth = floor(leading_zero_bits / 2), which gives a fanout of 4
/// (counting 2-bit chunks of zeros). More leading zeros = higher layer.
///
/// Does not validate the key.
pub fn layer_for_key(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash) / 2
}

/// Count leading zero bits in hash
fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

/// Validate MST key format
///
/// Keys are `collection/rkey`: printable ASCII (0x20-0x7E), at most
/// [`MAX_KEY_LEN`] bytes, exactly one `/` with something on both sides.
pub fn validate_key(key: &str) -> Result<()> {
    check_key(key).map_err(|cause| MstError::invalid_key(key, cause))
}

fn check_key(key: &str) -> std::result::Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }

    if key.len() > MAX_KEY_LEN {
        return Err(KeyError::TooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }

    if let Some((offset, &byte)) = key
        .as_bytes()
        .iter()
        .enumerate()
        .find(|(_, b)| !(0x20..=0x7e).contains(*b))
    {
        return Err(KeyError::NonPrintable { byte, offset });
    }

    let (collection, rkey) = key.split_once('/').ok_or(KeyError::MissingSeparator)?;
    if rkey.contains('/') {
        return Err(KeyError::ExtraSeparator);
    }
    if collection.is_empty() {
        return Err(KeyError::EmptyCollection);
    }
    if rkey.is_empty() {
        return Err(KeyError::EmptyRkey);
    }

    Ok(())
}

/// Total order over MST keys
///
/// Byte-lexicographic over the UTF-8 encoding; on a shared prefix the
/// shorter key sorts first.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

/// Count shared prefix length between two keys, in bytes
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}
