//! Placed-object instances and the chunk payload format.
//!
//! A payload is a little-endian `u32` instance count followed by that many
//! [`PlacedInstance`] records in their in-memory layout (40 bytes each).
//! There is no version field.

use bytemuck::{Pod, Zeroable};

use crate::core::error::Error;
use crate::core::types::{Quat, Result, Vec3};

/// Size of one serialized instance record
pub const INSTANCE_RECORD_SIZE: usize = std::mem::size_of::<PlacedInstance>();

const COUNT_SIZE: usize = 4;

/// One placed brick (40 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PlacedInstance {
    /// Object type, looked up in the part catalog
    pub part_type: u32,
    /// Palette / color index
    pub palette: u32,
    /// Position relative to the owning chunk's center
    pub position: [f32; 3],
    /// Rotation quaternion (x, y, z, w)
    pub rotation: [f32; 4],
    /// Nonzero when anchored to a neighbour
    pub connected: u32,
}

impl PlacedInstance {
    pub fn new(part_type: u32, palette: u32, position: Vec3, rotation: Quat, connected: bool) -> Self {
        Self {
            part_type,
            palette,
            position: position.to_array(),
            rotation: rotation.to_array(),
            connected: connected as u32,
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn rotation(&self) -> Quat {
        Quat::from_array(self.rotation)
    }

    pub fn is_connected(&self) -> bool {
        self.connected != 0
    }

    /// Copy with the position moved by `offset`
    pub fn translated(&self, offset: Vec3) -> Self {
        Self {
            position: (self.position() + offset).to_array(),
            ..*self
        }
    }
}

/// Serialize instances into a payload
pub fn encode_payload(instances: &[PlacedInstance]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COUNT_SIZE + instances.len() * INSTANCE_RECORD_SIZE);
    out.extend_from_slice(&(instances.len() as u32).to_le_bytes());
    out.extend_from_slice(bytemuck::cast_slice(instances));
    out
}

/// Parse a payload, rejecting any buffer whose length does not match its
/// declared count exactly
pub fn decode_payload(bytes: &[u8]) -> Result<Vec<PlacedInstance>> {
    if bytes.len() < COUNT_SIZE {
        return Err(Error::Payload(format!(
            "payload of {} bytes has no instance count",
            bytes.len()
        )));
    }
    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let records = &bytes[COUNT_SIZE..];

    let expected = count
        .checked_mul(INSTANCE_RECORD_SIZE)
        .ok_or_else(|| Error::Payload(format!("instance count {} overflows", count)))?;
    if records.len() != expected {
        return Err(Error::Payload(format!(
            "{} instances need {} bytes, payload has {}",
            count,
            expected,
            records.len()
        )));
    }

    // The buffer carries no alignment guarantee
    Ok(records
        .chunks_exact(INSTANCE_RECORD_SIZE)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}
