//! Address normalization and multi-word register decoding.
//!
//! Normalization rules and the word-order permutation follow
//! SPEC_FULL.md §4.2/§4.3, grounded in the original `_normalize_addr`
//! helper in `modbus_line.py`.

use crate::domain::types::{DataType, RegisterType, WordOrder};

/// Normalizes a user-facing address to a wire-level 0-based address.
///
/// `holding`/`input` addresses in the conventional 40001/30001 bases are
/// shifted down; `coil`/`discrete` 1-based addresses are shifted down by
/// one. Already-normalized addresses are left unchanged, so repeated
/// application is idempotent.
pub fn normalize_address(register_type: RegisterType, address: u32, normalize: bool) -> u32 {
    if !normalize {
        return address;
    }
    match register_type {
        RegisterType::Holding if address >= 40001 => address - 40001,
        RegisterType::Input if address >= 30001 => address - 30001,
        RegisterType::Coil | RegisterType::Discrete if (1..100000).contains(&address) => {
            address - 1
        }
        _ => address,
    }
}

/// Reorders the 16-bit words of a multi-word value per `order`, then
/// reinterprets the big-endian concatenation as `data_type`.
///
/// `words` must have length `data_type.words()`.
pub fn decode_words(words: &[u16], data_type: DataType, order: WordOrder) -> f64 {
    debug_assert_eq!(words.len(), data_type.words());

    if words.len() == 1 {
        return decode_scalar(words[0] as u64, data_type);
    }

    let reordered = reorder_words(words, order);
    let mut raw: u64 = 0;
    for w in &reordered {
        raw = (raw << 16) | (*w as u64);
    }
    decode_scalar(raw, data_type)
}

fn reorder_words(words: &[u16], order: WordOrder) -> Vec<u16> {
    match (words.len(), order) {
        (2, WordOrder::Ab) | (2, WordOrder::Abcd) => vec![words[0], words[1]],
        (2, WordOrder::Ba) | (2, WordOrder::Dcba) => vec![words[1], words[0]],
        (4, WordOrder::Abcd) => vec![words[0], words[1], words[2], words[3]],
        (4, WordOrder::Dcba) => vec![words[3], words[2], words[1], words[0]],
        (4, WordOrder::Badc) => vec![words[1], words[0], words[3], words[2]],
        (4, WordOrder::Cdab) => vec![words[2], words[3], words[0], words[1]],
        _ => words.to_vec(),
    }
}

fn decode_scalar(raw: u64, data_type: DataType) -> f64 {
    match data_type {
        DataType::U16 => (raw as u16) as f64,
        DataType::S16 => (raw as u16) as i16 as f64,
        DataType::U32 => (raw as u32) as f64,
        DataType::S32 => (raw as u32) as i32 as f64,
        DataType::U64 => raw as f64,
        DataType::S64 => raw as i64 as f64,
        DataType::F32 => f32::from_bits(raw as u32) as f64,
        DataType::F64 => f64::from_bits(raw),
    }
}

/// Applies scale and half-away-from-zero rounding per SPEC_FULL.md §4.3.
/// Integer types with `scale == 1.0` are returned unrounded to avoid
/// introducing float noise into whole numbers.
pub fn apply_scale(raw: f64, scale: f64, data_type: DataType, precision_decimals: u32) -> f64 {
    let scaled = raw * scale;
    if data_type.is_integer() && scale == 1.0 {
        return scaled;
    }
    round_half_away_from_zero(scaled, precision_decimals)
}

fn round_half_away_from_zero(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let rounded = if scaled >= 0.0 { (scaled + 0.5).floor() } else { (scaled - 0.5).ceil() };
    rounded / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_holding() {
        assert_eq!(normalize_address(RegisterType::Holding, 40001, true), 0);
        assert_eq!(normalize_address(RegisterType::Holding, 40100, true), 99);
    }

    #[test]
    fn test_normalize_input() {
        assert_eq!(normalize_address(RegisterType::Input, 30001, true), 0);
    }

    #[test]
    fn test_normalize_coil_discrete() {
        assert_eq!(normalize_address(RegisterType::Coil, 1, true), 0);
        assert_eq!(normalize_address(RegisterType::Discrete, 17, true), 16);
    }

    #[test]
    fn test_normalize_disabled_is_identity() {
        assert_eq!(normalize_address(RegisterType::Holding, 40001, false), 40001);
    }

    #[test]
    fn test_normalize_idempotent() {
        let once = normalize_address(RegisterType::Holding, 40100, true);
        let twice = normalize_address(RegisterType::Holding, once, true);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_decode_u32_ba_word_order_matches_scenario_6() {
        // SPEC_FULL.md §8 scenario 6: wire words [0x0001, 0x0000], BA order.
        let words = [0x0001u16, 0x0000u16];
        let value = decode_words(&words, DataType::U32, WordOrder::Ba);
        assert_eq!(value, 1.0);
    }

    #[test]
    fn test_decode_s16_negative() {
        let words = [0xFFFFu16];
        let value = decode_words(&words, DataType::S16, WordOrder::Ab);
        assert_eq!(value, -1.0);
    }

    #[test]
    fn test_decode_f32_abcd() {
        let bits = 1.5f32.to_bits();
        let words = [(bits >> 16) as u16, (bits & 0xFFFF) as u16];
        let value = decode_words(&words, DataType::F32, WordOrder::Abcd);
        assert_eq!(value, 1.5);
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_half_away_from_zero(1.2345, 3), 1.235);
        assert_eq!(round_half_away_from_zero(-1.2345, 3), -1.235);
    }

    #[test]
    fn test_apply_scale_keeps_integers_exact_at_unit_scale() {
        let v = apply_scale(42.0, 1.0, DataType::U16, 3);
        assert_eq!(v, 42.0);
    }

    #[test]
    fn test_apply_scale_rounds_analog() {
        let v = apply_scale(1234.0, 0.01, DataType::S16, 1);
        assert_eq!(v, 12.3);
    }
}
