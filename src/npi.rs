use serde::{Deserialize, Serialize};
use std::fmt;

/// A National Provider Identifier that passed shape validation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Npi(String);

impl Npi {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Npi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NpiDefect {
    PlaceholderOrEmpty,
    NonNumeric,
    WrongLength,
    ChecksumInvalid,
}

impl NpiDefect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlaceholderOrEmpty => "placeholder_or_empty",
            Self::NonNumeric => "non_numeric",
            Self::WrongLength => "wrong_length",
            Self::ChecksumInvalid => "checksum_invalid",
        }
    }
}

impl fmt::Display for NpiDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpiCheck {
    Valid(Npi),
    /// Ten digits, but the check digit does not verify.
    ChecksumInvalid(Npi),
    Malformed(NpiDefect),
}

fn is_placeholder(u: &str) -> bool {
    matches!(u, "" | "-" | "NONE" | "NULL" | "N/A" | "NA")
        || (!u.is_empty() && u.bytes().all(|b| b == b'0'))
}

/// NPI check digit: Luhn over the "80840" issuer prefix and all ten digits.
fn check_digit_verifies(npi_digits: &str) -> bool {
    let total: u32 = b"80840"
        .iter()
        .chain(npi_digits.as_bytes())
        .rev()
        .map(|b| u32::from(b - b'0'))
        .enumerate()
        .map(|(pos, d)| match (pos % 2, d * 2) {
            (0, _) => d,
            (_, doubled) if doubled > 9 => doubled - 9,
            (_, doubled) => doubled,
        })
        .sum();
    total % 10 == 0
}

pub fn classify_npi(raw: &str) -> NpiCheck {
    let u = raw.trim().to_ascii_uppercase();

    if is_placeholder(&u) {
        return NpiCheck::Malformed(NpiDefect::PlaceholderOrEmpty);
    }
    if !u.bytes().all(|b| b.is_ascii_digit()) {
        return NpiCheck::Malformed(NpiDefect::NonNumeric);
    }
    if u.len() != 10 {
        return NpiCheck::Malformed(NpiDefect::WrongLength);
    }
    if check_digit_verifies(&u) {
        NpiCheck::Valid(Npi(u))
    } else {
        NpiCheck::ChecksumInvalid(Npi(u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_valid_npi() {
        assert_eq!(
            classify_npi(" 1234567893 "),
            NpiCheck::Valid(Npi("1234567893".to_string()))
        );
    }

    #[test]
    fn check_digit_covers_every_position() {
        for npi in ["1111111112", "1245319599", "1003000126"] {
            assert!(check_digit_verifies(npi), "{npi}");
        }
        assert!(!check_digit_verifies("1245319598"));
        assert!(!check_digit_verifies("2245319599"));
    }

    #[test]
    fn flags_bad_check_digit() {
        assert!(matches!(
            classify_npi("1234567890"),
            NpiCheck::ChecksumInvalid(_)
        ));
    }

    #[test]
    fn rejects_malformed_shapes() {
        assert_eq!(
            classify_npi("123456789"),
            NpiCheck::Malformed(NpiDefect::WrongLength)
        );
        assert_eq!(
            classify_npi("12345678901"),
            NpiCheck::Malformed(NpiDefect::WrongLength)
        );
        assert_eq!(
            classify_npi("12345A7893"),
            NpiCheck::Malformed(NpiDefect::NonNumeric)
        );
        assert_eq!(
            classify_npi("0000000000"),
            NpiCheck::Malformed(NpiDefect::PlaceholderOrEmpty)
        );
        assert_eq!(
            classify_npi("n/a"),
            NpiCheck::Malformed(NpiDefect::PlaceholderOrEmpty)
        );
        assert_eq!(
            classify_npi(""),
            NpiCheck::Malformed(NpiDefect::PlaceholderOrEmpty)
        );
    }
}
