use num_bigint::{BigUint, RandBigInt};
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use crate::error::{Error, Result};
use crate::{KEY_BITS, KEY_LENGTH};

/// A 160-bit identifier that names both nodes and stored keys.
///
/// Equality is byte-wise. Closeness between two ids is measured with the XOR metric, see
/// [`NodeId::distance_rank`] and [`NodeId::xor_distance`].
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Default, Copy)]
pub struct NodeId([u8; KEY_LENGTH]);

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(self, f)
    }
}

impl From<[u8; KEY_LENGTH]> for NodeId {
    fn from(data: [u8; KEY_LENGTH]) -> Self {
        NodeId(data)
    }
}

impl NodeId {
    /// Constructs a `NodeId` from a byte slice. Fails with [`Error::InvalidIdentity`] unless the
    /// slice is exactly [KEY_LENGTH](crate::KEY_LENGTH) bytes long.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Self> {
        let bytes = bytes.as_ref();
        if bytes.len() != KEY_LENGTH {
            return Err(Error::InvalidIdentity(bytes.len()));
        }
        let mut ret = [0; KEY_LENGTH];
        ret.copy_from_slice(bytes);
        Ok(NodeId(ret))
    }

    /// The all-zero id, used as a placeholder for peers whose identity is not known yet.
    pub fn zero() -> Self {
        NodeId([0; KEY_LENGTH])
    }

    /// Constructs a new, random `NodeId`.
    pub fn rand() -> Self {
        NodeId(rand::random())
    }

    /// Constructs a random `NodeId` whose numeric value lies in `[lower, upper]`.
    pub(crate) fn rand_in_range(lower: &BigUint, upper: &BigUint) -> Self {
        let value = rand::thread_rng().gen_biguint_range(lower, &(upper.clone() + 1u32));
        NodeId::from_biguint(&value)
    }

    /// Derives the 160-bit digest of an application key (SHA-1).
    pub fn digest(key: &str) -> Self {
        NodeId(sha1_smol::Sha1::from(key.as_bytes()).digest().bytes())
    }

    /// Returns the raw bytes of `self`.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Returns the id as an unsigned integer, most significant byte first.
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Converts an integer below `2^160` back into an id.
    pub(crate) fn from_biguint(value: &BigUint) -> Self {
        let bytes = value.to_bytes_be();
        let mut ret = [0; KEY_LENGTH];
        let start = KEY_LENGTH.saturating_sub(bytes.len());
        ret[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(KEY_LENGTH)..]);
        NodeId(ret)
    }

    /// Returns the XOR result between `self` and `key`.
    pub fn xor(&self, key: &NodeId) -> NodeId {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ key.0[i];
        }
        NodeId(ret)
    }

    /// Returns the full XOR distance between `self` and `key` as an integer.
    pub fn xor_distance(&self, key: &NodeId) -> BigUint {
        self.xor(key).to_biguint()
    }

    /// Returns the number of leading zeros in `self`.
    fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..KEY_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize;
            }
        }
        ret
    }

    /// Rank of the XOR distance between `self` and `key`: `0` for equal ids, otherwise the bit
    /// length of their XOR, in `1..=160`. A smaller rank means a closer id.
    pub fn distance_rank(&self, key: &NodeId) -> usize {
        KEY_BITS - self.xor(key).leading_zeros()
    }
}
