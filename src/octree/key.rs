//! Fixed-size, order-preserving keys for the durable store

use std::ops::RangeInclusive;

use super::address::{ADDRESS_BITS, MAX_LEVEL, OctreeAddress};

/// What a stored value holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyKind {
    Chunk = 0,
    PlayerState = 1,
}

impl KeyKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Chunk),
            1 => Some(Self::PlayerState),
            _ => None,
        }
    }
}

const COORD_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const LEVEL_SHIFT: u32 = 60;
const X_SHIFT: u32 = 48;
const Y_SHIFT: u32 = 36;
const Z_SHIFT: u32 = 24;
const KIND_SHIFT: u32 = 16;

/// Level nibble of the reserved keys. Above every real level, so reserved
/// keys sort after all addresses.
const RESERVED_LEVEL: u64 = 0xF;

/// Packed key, most significant first:
///
/// ```text
/// level: 4 | x: 12 | y: 12 | z: 12 | kind: 8 | metadata: 16
/// ```
///
/// Stored big endian so that byte order equals integer order, which in
/// turn equals [`OctreeAddress`] order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersistenceKey(u64);

impl PersistenceKey {
    /// Key with an explicit kind and metadata
    pub fn new(address: OctreeAddress, kind: KeyKind, metadata: u16) -> Self {
        Self(
            (address.level as u64) << LEVEL_SHIFT
                | (address.x as u64 & COORD_MASK) << X_SHIFT
                | (address.y as u64 & COORD_MASK) << Y_SHIFT
                | (address.z as u64 & COORD_MASK) << Z_SHIFT
                | (kind as u64) << KIND_SHIFT
                | metadata as u64,
        )
    }

    /// Key of a chunk's payload
    pub fn chunk(address: OctreeAddress) -> Self {
        Self::new(address, KeyKind::Chunk, 0)
    }

    /// The single reserved key holding the player state
    pub fn player_state() -> Self {
        Self(RESERVED_LEVEL << LEVEL_SHIFT | (KeyKind::PlayerState as u64) << KIND_SHIFT)
    }

    /// Octree address part, `None` for reserved keys
    pub fn address(&self) -> Option<OctreeAddress> {
        let level = (self.0 >> LEVEL_SHIFT) as u8;
        if level > MAX_LEVEL {
            return None;
        }
        OctreeAddress::new(
            ((self.0 >> X_SHIFT) & COORD_MASK) as u32,
            ((self.0 >> Y_SHIFT) & COORD_MASK) as u32,
            ((self.0 >> Z_SHIFT) & COORD_MASK) as u32,
            level,
        )
    }

    pub fn kind(&self) -> Option<KeyKind> {
        KeyKind::from_byte((self.0 >> KIND_SHIFT) as u8)
    }

    pub fn metadata(&self) -> u16 {
        self.0 as u16
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parse a stored key, `None` unless exactly 8 bytes
    pub fn from_be_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }

    /// Byte range spanning every key of one level
    pub fn level_range(level: u8) -> RangeInclusive<[u8; 8]> {
        let level = (level as u64) << LEVEL_SHIFT;
        let span = (1u64 << LEVEL_SHIFT) - 1;
        level.to_be_bytes()..=(level | span).to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_roundtrip() {
        let address = OctreeAddress::new(4095, 17, 2048, 12).unwrap();
        let key = PersistenceKey::new(address, KeyKind::Chunk, 0xBEEF);
        assert_eq!(key.address(), Some(address));
        assert_eq!(key.kind(), Some(KeyKind::Chunk));
        assert_eq!(key.metadata(), 0xBEEF);
        assert_eq!(PersistenceKey::from_be_bytes(&key.to_be_bytes()), Some(key));
        assert_eq!(PersistenceKey::from_be_bytes(&[0; 7]), None);
    }

    #[test]
    fn test_byte_order_matches_address_order() {
        let mut addresses = Vec::new();
        for level in [0u8, 1, 3, 8, 12] {
            let last = (1u32 << level) - 1;
            for (x, y, z) in [(0, 0, 0), (last, 0, 0), (0, last, 0), (0, 0, last), (last / 2, last, 1.min(last))] {
                addresses.push(OctreeAddress::new(x, y, z, level).unwrap());
            }
        }
        addresses.sort();
        addresses.dedup();

        let mut keys: Vec<_> = addresses
            .iter()
            .map(|a| PersistenceKey::chunk(*a).to_be_bytes())
            .collect();
        keys.sort();

        let decoded: Vec<_> = keys
            .iter()
            .map(|k| PersistenceKey::from_be_bytes(k).and_then(|k| k.address()).unwrap())
            .collect();
        assert_eq!(decoded, addresses);
    }

    #[test]
    fn test_player_state_is_reserved() {
        let key = PersistenceKey::player_state();
        assert_eq!(key.address(), None);
        assert_eq!(key.kind(), Some(KeyKind::PlayerState));

        let deepest = OctreeAddress::new(4095, 4095, 4095, MAX_LEVEL).unwrap();
        assert!(key > PersistenceKey::chunk(deepest));
        assert!(!PersistenceKey::level_range(MAX_LEVEL).contains(&key.to_be_bytes()));
    }

    #[test]
    fn test_level_range() {
        let range = PersistenceKey::level_range(3);
        let inside = PersistenceKey::chunk(OctreeAddress::new(7, 7, 7, 3).unwrap());
        let first = PersistenceKey::chunk(OctreeAddress::new(0, 0, 0, 3).unwrap());
        let below = PersistenceKey::chunk(OctreeAddress::new(3, 3, 3, 2).unwrap());
        let above = PersistenceKey::chunk(OctreeAddress::new(0, 0, 0, 4).unwrap());

        assert!(range.contains(&inside.to_be_bytes()));
        assert!(range.contains(&first.to_be_bytes()));
        assert!(!range.contains(&below.to_be_bytes()));
        assert!(!range.contains(&above.to_be_bytes()));
    }
}
