//! 64-bit source lookup words: a source index in the high bits and a block
//! offset in the low bits, or a raw count marker.
//!
//! The index field takes `bits` (32..=40) high bits and the offset the
//! remaining `64 - bits`. The all-ones value of either field is reserved, so
//! a word whose top 40 bits are all ones can never be a packed pair; such
//! words carry a count in their low 24 bits instead.

use crate::error::{Error, Result};

pub const MIN_INDEX_BITS: u32 = 32;
pub const MAX_INDEX_BITS: u32 = 40;

const COUNT_BITS: u32 = 64 - MAX_INDEX_BITS;
const COUNT_MARKER: u64 = !0u64 << COUNT_BITS;

/// Largest count a marker word can carry.
pub const MAX_COUNT: u64 = (1u64 << COUNT_BITS) - 1;

fn check_bits(bits: u32) -> Result<()> {
    if (MIN_INDEX_BITS..=MAX_INDEX_BITS).contains(&bits) {
        Ok(())
    } else {
        Err(Error::OutOfRange { bits })
    }
}

fn field_mask(width: u32) -> u64 {
    (1u64 << width) - 1
}

/// Pack `index` and `offset` into one word.
pub fn pack(bits: u32, index: u64, offset: u64) -> Result<u64> {
    check_bits(bits)?;
    let offset_bits = 64 - bits;

    // The all-ones pattern of each field is reserved for the count marker.
    if index >= field_mask(bits) {
        return Err(Error::InvalidValue {
            what: "source lookup index",
            value: index,
            bits,
        });
    }
    if offset >= field_mask(offset_bits) {
        return Err(Error::InvalidValue {
            what: "hash block offset",
            value: offset,
            bits: offset_bits,
        });
    }

    Ok((index << offset_bits) | offset)
}

pub fn unpack_index(bits: u32, word: u64) -> Result<u64> {
    check_bits(bits)?;
    Ok(word >> (64 - bits))
}

pub fn unpack_offset(bits: u32, word: u64) -> Result<u64> {
    check_bits(bits)?;
    Ok(word & field_mask(64 - bits))
}

/// Build a count marker word.
pub fn make_count(count: u64) -> Result<u64> {
    if count > MAX_COUNT {
        return Err(Error::InvalidValue {
            what: "count",
            value: count,
            bits: COUNT_BITS,
        });
    }
    Ok(COUNT_MARKER | count)
}

pub fn is_count(word: u64) -> bool {
    word & COUNT_MARKER == COUNT_MARKER
}

/// Count stored in a marker word.
pub fn unpack_count(word: u64) -> u64 {
    word & MAX_COUNT
}

/// Number of entries a word stands for: 1 for a packed pair.
pub fn count(word: u64) -> u64 {
    if is_count(word) { unpack_count(word) } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_round_trip(bits: u32, index: u64, offset: u64) {
        let word = pack(bits, index, offset).unwrap();
        assert_eq!(count(word), 1);
        assert_eq!(unpack_index(bits, word).unwrap(), index);
        assert_eq!(unpack_offset(bits, word).unwrap(), offset);
    }

    #[test]
    fn bits_32() {
        check_round_trip(32, 2, 3);
        check_round_trip(32, 0xffff_fffe, 4);
        check_round_trip(32, 5, 0xffff_fffe);

        assert!(matches!(
            pack(32, 0xffff_ffff, 0),
            Err(Error::InvalidValue { bits: 32, .. })
        ));
        assert!(matches!(
            pack(32, 0, 0xffff_ffff),
            Err(Error::InvalidValue { bits: 32, .. })
        ));
    }

    #[test]
    fn bits_33_not_byte_aligned() {
        check_round_trip(33, 2, 3);
        check_round_trip(33, 0x1_ffff_fffe, 4);
        check_round_trip(33, 5, 0x7fff_fffe);

        assert!(pack(33, 0x1_ffff_ffff, 0).is_err());
        assert!(pack(33, 0, 0x7fff_ffff).is_err());
    }

    #[test]
    fn bits_40() {
        check_round_trip(40, 6, 7);
        check_round_trip(40, 0xff_ffff_fffe, 8);
        check_round_trip(40, 9, 0xff_fffe);

        assert!(pack(40, 0xff_ffff_ffff, 10).is_err());
        assert!(pack(40, 11, 0xff_ffff).is_err());
    }

    #[test]
    fn every_width_keeps_fields_apart() {
        for bits in MIN_INDEX_BITS..=MAX_INDEX_BITS {
            let max_index = field_mask(bits) - 1;
            let max_offset = field_mask(64 - bits) - 1;
            check_round_trip(bits, max_index, 0);
            check_round_trip(bits, 0, max_offset);
            check_round_trip(bits, max_index, max_offset);
        }
    }

    #[test]
    fn bit_count_bounds() {
        assert!(matches!(pack(31, 0, 0), Err(Error::OutOfRange { bits: 31 })));
        assert!(matches!(pack(41, 0, 0), Err(Error::OutOfRange { bits: 41 })));
        assert!(unpack_index(64, 0).is_err());
        assert!(unpack_offset(0, 0).is_err());
    }

    #[test]
    fn count_marker() {
        let word = make_count(2).unwrap();
        assert!(is_count(word));
        assert_eq!(unpack_count(word), 2);
        assert_eq!(count(word), 2);

        assert_eq!(count(make_count(MAX_COUNT).unwrap()), MAX_COUNT);
        assert!(make_count(MAX_COUNT + 1).is_err());
    }
}
