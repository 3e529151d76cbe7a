//! Property tests for the segmented/linear address model.

use dosprobe::address::{Address, SegOff};
use proptest::prelude::*;

proptest! {
    /// parse(format(seg, off)).linear == (seg << 4) + off for the whole pair space.
    #[test]
    fn formatted_pair_parses_back_to_the_same_linear(seg: u16, off: u16) {
        let addr = Address::Segmented(SegOff::new(seg, off));
        let parsed: Address = addr.to_string().parse().unwrap();
        prop_assert_eq!(parsed, addr);
        prop_assert_eq!(parsed.linear(), ((seg as u32) << 4) + off as u32);
    }

    /// A linear literal decomposes canonically and recomposes to itself
    /// (20-bit address space).
    #[test]
    fn linear_decomposition_is_canonical(linear in 0u32..=0xFFFFF) {
        let addr: Address = format!("{linear:#x}").parse().unwrap();
        let pair = addr.seg_off();
        prop_assert_eq!(pair.segment, ((linear >> 4) & 0xFFFF) as u16);
        prop_assert_eq!(pair.offset, (linear & 0xF) as u16);
        prop_assert_eq!(pair.linear(), linear);
    }

    /// Decimal literals mean the same linear address as their hex form.
    #[test]
    fn decimal_and_hex_literals_agree(linear in 0u32..=0xFFFFF) {
        let dec: Address = linear.to_string().parse().unwrap();
        let hex: Address = format!("{linear:#X}").parse().unwrap();
        prop_assert_eq!(dec.linear(), hex.linear());
    }

    /// Parsing never panics on arbitrary input.
    #[test]
    fn parser_is_total(input in "\\PC{0,12}") {
        let _ = input.parse::<Address>();
    }
}
