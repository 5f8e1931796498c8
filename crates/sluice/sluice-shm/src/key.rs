use std::fmt;
use std::str::FromStr;

/// Spacing between the resources derived from a single base key.
pub const KEY_INCREMENT: i32 = 0x0001_0000;

/// Numeric identifier of a shared resource.
///
/// Displayed and parsed as hexadecimal, with or without a `0x` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub i32);

impl Key {
    /// Base key used by operator tooling when none is given.
    pub const DEFAULT: Key = Key(0xdada);

    /// The key `n` increments above this one. Wraps on overflow.
    #[inline]
    pub fn offset(self, n: u32) -> Key {
        Key(self.0.wrapping_add(KEY_INCREMENT.wrapping_mul(n as i32)))
    }

    /// The adjacent key, used to pair a header ring with its data ring.
    #[inline]
    pub fn next(self) -> Key {
        Key(self.0.wrapping_add(1))
    }

    pub(crate) fn file_name(self) -> String {
        format!("sluice_{:08x}", self.0 as u32)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0 as u32)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid key '{0}': expected a hexadecimal number")]
pub struct ParseKeyError(String);

impl FromStr for Key {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u32::from_str_radix(digits, 16)
            .map(|v| Key(v as i32))
            .map_err(|_| ParseKeyError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        assert_eq!("dada".parse::<Key>().unwrap(), Key(0xdada));
        assert_eq!("0xDADA".parse::<Key>().unwrap(), Key(0xdada));
        assert!("xyz".parse::<Key>().is_err());
        assert!("".parse::<Key>().is_err());
    }

    #[test]
    fn derived_keys_are_spaced_by_increment() {
        let base = Key(0xdada);
        assert_eq!(base.offset(1), Key(0x1dada));
        assert_eq!(base.offset(10), Key(0xadada));
        assert_eq!(base.next(), Key(0xdadb));
    }

    #[test]
    fn offset_wraps() {
        let k = Key(i32::MAX);
        assert_eq!(k.offset(1), Key(i32::MAX.wrapping_add(KEY_INCREMENT)));
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(Key(0xdada).to_string(), "0xdada");
        assert_eq!(Key(-1).file_name(), "sluice_ffffffff");
    }
}
