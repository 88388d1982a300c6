// ── Device address ──
//
// Tags are keyed by their BLE address. Addresses arrive from config
// files, scanners and users in assorted spellings; everything inside
// the crate sees the normalized upper-case, colon-separated form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device address '{input}': expected AA:BB:CC:DD:EE:FF")]
pub struct AddressError {
    pub input: String,
}

/// Normalized BLE device address (`AA:BB:CC:DD:EE:FF`).
///
/// Accepts `:` or `-` separators in any letter case. Anonymous
/// three-octet addresses (`AA:BB:CC`) reported by some scanners are
/// accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagAddress(String);

impl TagAddress {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let err = || AddressError {
            input: input.to_owned(),
        };

        let octets: Vec<&str> = trimmed.split([':', '-']).collect();
        if octets.len() != 6 && octets.len() != 3 {
            return Err(err());
        }
        // Mixed separators ("AA:BB-CC...") are rejected.
        if trimmed.contains(':') && trimmed.contains('-') {
            return Err(err());
        }
        if !octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(err());
        }

        Ok(Self(octets.join(":").to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Anonymous addresses carry only three octets.
    pub fn is_anonymous(&self) -> bool {
        self.0.len() == 8
    }

    /// Address with everything past the first two octets masked, for
    /// diagnostics that may be shared.
    pub fn redacted(&self) -> String {
        let visible: String = self.0.chars().take(6).collect();
        format!("{visible}****")
    }
}

impl fmt::Display for TagAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TagAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TagAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TagAddress> for String {
    fn from(addr: TagAddress) -> Self {
        addr.0
    }
}

impl AsRef<str> for TagAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_separators() {
        let addr: TagAddress = "aa-bb-cc-dd-ee-0f".parse().unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:0F");
        assert_eq!(addr, "AA:BB:CC:DD:EE:0F".parse().unwrap());
        assert!(!addr.is_anonymous());
    }

    #[test]
    fn accepts_anonymous_form() {
        let addr = TagAddress::parse(" 12:ab:cd ").unwrap();
        assert_eq!(addr.as_str(), "12:AB:CD");
        assert!(addr.is_anonymous());
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in [
            "",
            "AA:BB:CC:DD:EE",
            "AA:BB:CC:DD:EE:FF:00",
            "AA:BB:CC:DD:EE:GG",
            "AABBCCDDEEFF",
            "AA:BB-CC:DD:EE:FF",
            "A:BB:CC:DD:EE:FF",
        ] {
            assert!(TagAddress::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn redaction_keeps_two_octets() {
        let addr = TagAddress::parse("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(addr.redacted(), "AA:BB:****");
    }

    #[test]
    fn serde_uses_normalized_string() {
        let addr: TagAddress = serde_json::from_str("\"aa:bb:cc:dd:ee:ff\"").unwrap();
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"AA:BB:CC:DD:EE:FF\"");
        assert!(serde_json::from_str::<TagAddress>("\"nope\"").is_err());
    }
}
