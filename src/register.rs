use serde::de::{Error as _, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// x86 register set exposed by both emulator backends. Declaration order is
/// the order of the remote-debug `g` reply (ten 32-bit registers, then the
/// six segment registers).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Register {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    Eip,
    Eflags,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

/// Register order of the remote-debug full dump (`g`).
pub const GDB_DUMP_ORDER: [Register; 16] = [
    Register::Eax,
    Register::Ecx,
    Register::Edx,
    Register::Ebx,
    Register::Esp,
    Register::Ebp,
    Register::Esi,
    Register::Edi,
    Register::Eip,
    Register::Eflags,
    Register::Cs,
    Register::Ss,
    Register::Ds,
    Register::Es,
    Register::Fs,
    Register::Gs,
];

impl Register {
    /// Segment registers hold 16 bits; everything else is full-width.
    pub fn is_segment(self) -> bool {
        matches!(
            self,
            Register::Cs | Register::Ss | Register::Ds | Register::Es | Register::Fs | Register::Gs
        )
    }
}

/// A full or partial register dump. The socket-based backend always fills
/// all sixteen entries; the session-based backend fills whatever its debug
/// log happened to contain. Serializes as `{"eax": 4660, "ecx": …}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile(BTreeMap<Register, u32>);

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; segment registers are masked to 16 bits.
    pub fn set(&mut self, reg: Register, value: u32) {
        let value = if reg.is_segment() {
            value & 0xFFFF
        } else {
            value
        };
        self.0.insert(reg, value);
    }

    pub fn get(&self, reg: Register) -> Option<u32> {
        self.0.get(&reg).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Register, u32)> + '_ {
        self.0.iter().map(|(r, v)| (*r, *v))
    }

    /// Decode the 64-byte remote-debug `g` reply: sixteen little-endian
    /// 32-bit words in [`GDB_DUMP_ORDER`].
    pub fn from_gdb_dump(words: &[u32; 16]) -> Self {
        let mut file = RegisterFile::new();
        for (reg, word) in GDB_DUMP_ORDER.iter().zip(words) {
            file.set(*reg, *word);
        }
        file
    }
}

impl Serialize for RegisterFile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (reg, value) in &self.0 {
            map.serialize_entry(&reg.to_string(), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RegisterFile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FileVisitor;

        impl<'de> Visitor<'de> for FileVisitor {
            type Value = RegisterFile;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of register name to integer")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut file = RegisterFile::new();
                while let Some((name, value)) = access.next_entry::<String, u32>()? {
                    let reg = Register::from_str(&name)
                        .map_err(|_| A::Error::custom(format!("unknown register `{name}`")))?;
                    file.set(reg, value);
                }
                Ok(file)
            }
        }

        deserializer.deserialize_map(FileVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdb_dump_order_and_masking() {
        let mut words = [0u32; 16];
        words[0] = 0x12345678; // eax
        words[8] = 0x0000_0100; // eip
        words[10] = 0xDEAD_A000; // cs, upper half must be dropped
        let file = RegisterFile::from_gdb_dump(&words);

        assert_eq!(file.get(Register::Eax), Some(0x12345678));
        assert_eq!(file.get(Register::Eip), Some(0x100));
        assert_eq!(file.get(Register::Cs), Some(0xA000));
        assert_eq!(file.len(), 16);
    }

    #[test]
    fn serializes_as_lowercase_map() {
        let mut file = RegisterFile::new();
        file.set(Register::Eax, 0x1234);
        file.set(Register::Cs, 0xA000);
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["eax"], 0x1234);
        assert_eq!(json["cs"], 0xA000);
    }

    #[test]
    fn deserializes_from_map() {
        let file: RegisterFile =
            serde_json::from_str(r#"{"eax": 1, "eflags": 2, "gs": 70000}"#).unwrap();
        assert_eq!(file.get(Register::Eax), Some(1));
        assert_eq!(file.get(Register::Eflags), Some(2));
        // segment values are masked on the way in
        assert_eq!(file.get(Register::Gs), Some(70000 & 0xFFFF));
    }

    #[test]
    fn register_names_round_trip() {
        for reg in GDB_DUMP_ORDER {
            assert_eq!(Register::from_str(&reg.to_string()).unwrap(), reg);
        }
    }
}
