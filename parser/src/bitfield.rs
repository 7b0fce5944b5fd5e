//! Numeric decode of fixed-width packed fields.
//!
//! Minimap vision packets pack (x, y, yaw) into a single integer; squadron
//! identifiers pack (owner, index, purpose, sortie counter). The arithmetic
//! here must be bit-exact: it is the same linear de-quantization the game
//! client applies, so no rounding beyond standard f64 behavior is allowed.

use tracing::warn;

/// One packed field: quantized over `[min, max]` using `bits` bits.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub min: f64,
    pub max: f64,
    pub bits: u32,
}

impl FieldSpec {
    pub const fn new(min: f64, max: f64, bits: u32) -> Self {
        Self { min, max, bits }
    }
}

/// Pack layout of minimap vision diff entries: x, y at ±2500 over 11 bits
/// each, yaw at ±π over 8 bits. 30 bits of the 32-bit word; the top 2 bits
/// must come back zero.
pub const MINIMAP_PACK: [FieldSpec; 3] = [
    FieldSpec::new(-2500.0, 2500.0, 11),
    FieldSpec::new(-2500.0, 2500.0, 11),
    FieldSpec::new(-std::f64::consts::PI, std::f64::consts::PI, 8),
];

/// Linear de-quantization of a single packed field.
pub fn decode_field(packed: u64, min: f64, max: f64, bits: u32) -> f64 {
    let levels = ((1u64 << bits) - 1) as f64;
    packed as f64 / levels * (min.abs() + max.abs()) - min.abs()
}

/// Result of [`decode_fixed_fields`]. A non-zero residual means the packed
/// word had more bits than the declared layout: a corrupt or
/// version-mismatched packet.
#[derive(Debug, Clone)]
pub struct DecodedFields {
    pub values: Vec<f64>,
    pub residual: u64,
}

impl DecodedFields {
    pub fn is_clean(&self) -> bool {
        self.residual == 0
    }
}

/// Decodes successive low-order bit groups in declaration order,
/// right-shifting the packed word after each field.
pub fn decode_fixed_fields(mut packed: u64, fields: &[FieldSpec]) -> DecodedFields {
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        let mask = (1u64 << field.bits) - 1;
        values.push(decode_field(packed & mask, field.min, field.max, field.bits));
        packed >>= field.bits;
    }
    if packed != 0 {
        warn!(residual = packed, "non-zero residual after fixed-field decode");
    }
    DecodedFields {
        values,
        residual: packed,
    }
}

/// Squadron purpose codes carried in the packed squadron id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SquadronPurpose {
    /// Player-controlled main squadron.
    Main,
    /// Post-attack / recalled squadron flying home.
    PostAttack,
    /// Fighters launched by a squadron.
    SquadronFighter,
    /// Fighters launched by a ship.
    ShipFighter,
    Scout,
    AirDrop,
    /// Air strike (HE or depth charge).
    AirStrike,
    Unknown(u8),
}

impl SquadronPurpose {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => SquadronPurpose::Main,
            1 => SquadronPurpose::PostAttack,
            2 => SquadronPurpose::SquadronFighter,
            3 => SquadronPurpose::ShipFighter,
            4 => SquadronPurpose::Scout,
            5 => SquadronPurpose::AirDrop,
            6 => SquadronPurpose::AirStrike,
            other => SquadronPurpose::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SquadronPurpose::Main => 0,
            SquadronPurpose::PostAttack => 1,
            SquadronPurpose::SquadronFighter => 2,
            SquadronPurpose::ShipFighter => 3,
            SquadronPurpose::Scout => 4,
            SquadronPurpose::AirDrop => 5,
            SquadronPurpose::AirStrike => 6,
            SquadronPurpose::Unknown(c) => c,
        }
    }

    /// Fighter cover squadrons patrol a fixed point rather than fly a route.
    pub fn is_fighter_cover(self) -> bool {
        matches!(
            self,
            SquadronPurpose::SquadronFighter | SquadronPurpose::ShipFighter
        )
    }
}

/// Unpacked squadron identity: (owner-id:32, squadron-index:3, purpose:3,
/// sortie-counter:1), lowest bits first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SquadronId {
    pub owner_id: u32,
    pub squadron_index: u8,
    pub purpose: SquadronPurpose,
    pub sortie_counter: u8,
}

/// Splits a packed squadron id into its fixed-layout components.
pub fn decode_plane_id(packed: u64) -> SquadronId {
    let owner_id = (packed & 0xFFFF_FFFF) as u32;
    let rest = packed >> 32;
    let squadron_index = (rest & 0b111) as u8;
    let purpose = ((rest >> 3) & 0b111) as u8;
    let sortie_counter = ((rest >> 6) & 0b1) as u8;
    SquadronId {
        owner_id,
        squadron_index,
        purpose: SquadronPurpose::from_code(purpose),
        sortie_counter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_field(value: f64, min: f64, max: f64, bits: u32) -> u64 {
        let levels = ((1u64 << bits) - 1) as f64;
        ((value + min.abs()) / (min.abs() + max.abs()) * levels).round() as u64
    }

    #[test]
    fn decode_field_endpoints() {
        assert_eq!(decode_field(0, -2500.0, 2500.0, 11), -2500.0);
        assert_eq!(decode_field(2047, -2500.0, 2500.0, 11), 2500.0);
    }

    #[test]
    fn fixed_fields_roundtrip_within_quantization() {
        let x = 1234.0f64;
        let y = -987.0f64;
        let yaw = 1.5f64;
        let px = encode_field(x, -2500.0, 2500.0, 11);
        let py = encode_field(y, -2500.0, 2500.0, 11);
        let pyaw = encode_field(yaw, -std::f64::consts::PI, std::f64::consts::PI, 8);
        let packed = px | (py << 11) | (pyaw << 22);

        let decoded = decode_fixed_fields(packed, &MINIMAP_PACK);
        assert!(decoded.is_clean());
        // One quantization step of slack per field.
        assert!((decoded.values[0] - x).abs() <= 5000.0 / 2047.0);
        assert!((decoded.values[1] - y).abs() <= 5000.0 / 2047.0);
        assert!((decoded.values[2] - yaw).abs() <= (2.0 * std::f64::consts::PI) / 255.0);
    }

    #[test]
    fn fixed_fields_flags_nonzero_residual() {
        let packed = 1u64 << 31; // a bit above the declared 30-bit layout
        let decoded = decode_fixed_fields(packed, &MINIMAP_PACK);
        assert!(!decoded.is_clean());
    }

    #[test]
    fn plane_id_unpacks_lowest_bits_first() {
        let owner: u64 = 543210;
        let index: u64 = 2;
        let purpose: u64 = 3;
        let sortie: u64 = 1;
        let packed = owner | (index << 32) | (purpose << 35) | (sortie << 38);

        let id = decode_plane_id(packed);
        assert_eq!(id.owner_id, 543210);
        assert_eq!(id.squadron_index, 2);
        assert_eq!(id.purpose, SquadronPurpose::ShipFighter);
        assert_eq!(id.sortie_counter, 1);
        assert!(id.purpose.is_fighter_cover());
    }

    #[test]
    fn purpose_codes_roundtrip() {
        for code in 0u8..8 {
            assert_eq!(SquadronPurpose::from_code(code).code(), code);
        }
    }
}
