//! Proximity-order bins.
//!
//! Addresses are classed by the length of the bit prefix they share with
//! the local node's overlay address. Bin keys travel inside stream
//! identifiers in base-36 form.

use thiserror::Error;

use shoal_core::Address;

/// Deepest proximity order tracked. Bins beyond this collapse into it.
pub const MAX_PO: u8 = 16;

/// Base for bin keys inside stream identifiers.
const BIN_KEY_BASE: u32 = 36;

/// Proximity order of `b` relative to `a`: the number of leading bits the
/// two addresses share, capped at [`MAX_PO`].
pub fn proximity(a: &Address, b: &Address) -> u8 {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            let po = i as u32 * 8 + diff.leading_zeros();
            return (po as u8).min(MAX_PO);
        }
    }
    MAX_PO
}

/// Format a bin number as a SYNC stream key.
pub fn format_bin_key(bin: u8) -> String {
    // single base-36 digit for bins 0..=35; MAX_PO keeps us well inside
    char::from_digit(bin as u32, BIN_KEY_BASE)
        .map(String::from)
        .unwrap_or_else(|| format!("{bin}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid bin key {key:?}")]
pub struct InvalidBinKey {
    pub key: String,
}

/// Parse a SYNC stream key back into a bin number.
pub fn parse_bin_key(key: &str) -> Result<u8, InvalidBinKey> {
    let bin = u8::from_str_radix(key, BIN_KEY_BASE).map_err(|_| InvalidBinKey {
        key: key.to_owned(),
    })?;
    if bin > MAX_PO {
        return Err(InvalidBinKey {
            key: key.to_owned(),
        });
    }
    Ok(bin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_addresses_hit_the_cap() {
        let a = [0xaa; 32];
        assert_eq!(proximity(&a, &a), MAX_PO);
    }

    #[test]
    fn first_bit_differs() {
        let a = [0x00; 32];
        let mut b = [0x00; 32];
        b[0] = 0x80;
        assert_eq!(proximity(&a, &b), 0);
    }

    #[test]
    fn shared_prefix_counts_bits_not_bytes() {
        let a = [0x00; 32];
        let mut b = [0x00; 32];
        b[1] = 0x10; // 8 shared bits in byte 0, then 3 more
        assert_eq!(proximity(&a, &b), 11);
    }

    #[test]
    fn bin_key_round_trip() {
        for bin in 0..=MAX_PO {
            let key = format_bin_key(bin);
            assert_eq!(parse_bin_key(&key), Ok(bin));
        }
    }

    #[test]
    fn bin_key_ten_is_base36() {
        assert_eq!(format_bin_key(10), "a");
        assert_eq!(parse_bin_key("a"), Ok(10));
    }

    #[test]
    fn out_of_range_and_garbage_keys_are_rejected() {
        assert!(parse_bin_key("zz").is_err());
        assert!(parse_bin_key("").is_err());
        assert!(parse_bin_key("h").is_err()); // 17 > MAX_PO
    }
}
