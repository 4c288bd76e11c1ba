//! Opaque light handles.
//!
//! A handle packs `{kind, generation, index}` into 32 bits:
//!
//! | bits   | field      |
//! |--------|------------|
//! | 0..8   | kind tag   |
//! | 8..16  | generation |
//! | 16..32 | slot index |
//!
//! Decoding validates the kind tag, so the all-bits-set sentinel never names a light.

use serde::{Deserialize, Serialize};

/// Kind of light addressed by a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightKind {
    Point,
    Directional,
}

impl LightKind {
    const POINT_TAG: u32 = 1;
    const DIRECTIONAL_TAG: u32 = 2;

    fn tag(self) -> u32 {
        match self {
            Self::Point => Self::POINT_TAG,
            Self::Directional => Self::DIRECTIONAL_TAG,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            Self::POINT_TAG => Some(Self::Point),
            Self::DIRECTIONAL_TAG => Some(Self::Directional),
            _ => None,
        }
    }
}

/// Generation-checked reference to a light slot in a [`crate::LightRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LightHandle {
    kind: LightKind,
    generation: u8,
    index: u16,
}

impl LightHandle {
    /// Raw value that never decodes to a handle.
    pub const INVALID_BITS: u32 = u32::MAX;

    const KIND_SHIFT: u32 = 0;
    const GENERATION_SHIFT: u32 = 8;
    const INDEX_SHIFT: u32 = 16;

    pub fn new(kind: LightKind, generation: u8, index: u16) -> Self {
        Self {
            kind,
            generation,
            index,
        }
    }

    pub fn kind(&self) -> LightKind {
        self.kind
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// Packs the handle into its 32-bit wire form.
    pub fn to_bits(self) -> u32 {
        (self.kind.tag() << Self::KIND_SHIFT)
            | (u32::from(self.generation) << Self::GENERATION_SHIFT)
            | (u32::from(self.index) << Self::INDEX_SHIFT)
    }

    /// Unpacks a raw value, rejecting unknown kind tags.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let kind = LightKind::from_tag((bits >> Self::KIND_SHIFT) & 0xFF)?;
        let generation = ((bits >> Self::GENERATION_SHIFT) & 0xFF) as u8;
        let index = ((bits >> Self::INDEX_SHIFT) & 0xFFFF) as u16;
        Some(Self::new(kind, generation, index))
    }

    /// Raw encoding of an optional handle, using [`Self::INVALID_BITS`] for `None`.
    pub fn encode(handle: Option<Self>) -> u32 {
        handle.map_or(Self::INVALID_BITS, Self::to_bits)
    }
}

impl From<LightHandle> for u32 {
    fn from(handle: LightHandle) -> Self {
        handle.to_bits()
    }
}

impl TryFrom<u32> for LightHandle {
    type Error = crate::LightError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        Self::from_bits(bits).ok_or(crate::LightError::InvalidHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_covers_field_extremes() {
        for kind in [LightKind::Point, LightKind::Directional] {
            for generation in [0u8, 1, 127, 255] {
                for index in [0u16, 1, 0x7FFF, u16::MAX] {
                    let handle = LightHandle::new(kind, generation, index);
                    assert_eq!(LightHandle::from_bits(handle.to_bits()), Some(handle));
                }
            }
        }
    }

    #[test]
    fn sentinel_and_unknown_tags_do_not_decode() {
        assert_eq!(LightHandle::from_bits(LightHandle::INVALID_BITS), None);
        assert_eq!(LightHandle::from_bits(0), None);
        assert_eq!(LightHandle::from_bits(0x0000_0003), None);
        assert_eq!(LightHandle::encode(None), u32::MAX);
    }

    #[test]
    fn layout_matches_documented_bit_fields() {
        let handle = LightHandle::new(LightKind::Directional, 0xAB, 0x1234);
        assert_eq!(handle.to_bits(), 0x1234_AB02);
        assert!(LightHandle::try_from(0x1234_AB02u32).is_ok());
    }
}
