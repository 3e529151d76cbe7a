use crate::error::Error;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Real-mode segment:offset pair as the guest sees it.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
pub struct SegOff {
    pub segment: u16,
    pub offset: u16,
}

impl SegOff {
    pub fn new(segment: u16, offset: u16) -> Self {
        SegOff { segment, offset }
    }

    /// Linear form: `(segment << 4) + offset`. May exceed one megabyte
    /// (the HMA wrap is the emulator's business, not ours).
    #[inline(always)]
    pub fn linear(self) -> u32 {
        ((self.segment as u32) << 4) + self.offset as u32
    }
}

impl Display for SegOff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:04X}:{:04X}", self.segment, self.offset))
    }
}

/// Guest address as given by a caller: either an explicit segment:offset
/// pair or a linear literal. Parsing is centralized here; raw strings never
/// travel past this boundary.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub enum Address {
    Segmented(SegOff),
    Linear(u32),
}

impl Address {
    pub fn linear(self) -> u32 {
        match self {
            Address::Segmented(so) => so.linear(),
            Address::Linear(l) => l,
        }
    }

    /// Canonical pair: an explicit pair is kept as written, a linear literal
    /// decomposes to `segment = (linear >> 4) & 0xFFFF`, `offset = linear & 0xF`.
    pub fn seg_off(self) -> SegOff {
        match self {
            Address::Segmented(so) => so,
            Address::Linear(l) => SegOff {
                segment: ((l >> 4) & 0xFFFF) as u16,
                offset: (l & 0xF) as u16,
            },
        }
    }

}

impl From<SegOff> for Address {
    fn from(so: SegOff) -> Self {
        Address::Segmented(so)
    }
}

impl From<u32> for Address {
    fn from(linear: u32) -> Self {
        Address::Linear(linear)
    }
}

fn hex_component(s: &str) -> Option<u16> {
    if s.is_empty() || s.len() > 4 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(s, 16).ok()
}

impl FromStr for Address {
    type Err = Error;

    /// Accepted literals: `SSSS:OOOO` (hex pair), `0x…` (hex linear) or a
    /// decimal linear.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::BadAddress(s.to_string());

        if let Some((seg, off)) = s.split_once(':') {
            let segment = hex_component(seg).ok_or_else(bad)?;
            let offset = hex_component(off).ok_or_else(bad)?;
            return Ok(Address::Segmented(SegOff { segment, offset }));
        }

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad());
            }
            return u32::from_str_radix(hex, 16)
                .map(Address::Linear)
                .map_err(|_| bad());
        }

        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<u32>().map(Address::Linear).map_err(|_| bad());
        }

        Err(bad())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Segmented(so) => so.fmt(f),
            Address::Linear(l) => f.write_fmt(format_args!("{l:#X}")),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
