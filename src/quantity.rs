//! Kubernetes-style storage quantities
//!
//! Sizes cross this system as label values, config map entries, and claim
//! capacity requests, all in the orchestrator's quantity notation (`128Mi`,
//! `50Gi`, plain byte counts). The original text is kept alongside the byte
//! value so an entry round-trips through the map encoding unchanged.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// A parsed storage quantity. Equality is on the byte value, not the text.
#[derive(Debug, Clone)]
pub struct Quantity {
    raw: String,
    bytes: u64,
}

impl Quantity {
    /// Quantity of `mib` mebibytes, rendered in binary notation.
    pub fn from_mib(mib: u64) -> Self {
        Self {
            raw: format!("{mib}Mi"),
            bytes: mib * MIB,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whole mebibytes, rounded down. Used for tmpfs `size=<n>M` options.
    pub fn mebibytes(&self) -> u64 {
        self.bytes / MIB
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == 0
    }

    /// The API-server representation for resource requests.
    pub fn to_k8s(&self) -> k8s_openapi::apimachinery::pkg::api::resource::Quantity {
        k8s_openapi::apimachinery::pkg::api::resource::Quantity(self.raw.clone())
    }
}

impl FromStr for Quantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(Error::QuantityParse("empty quantity".into()));
        }

        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (num, suffix) = raw.split_at(split);
        let value: u64 = num
            .parse()
            .map_err(|_| Error::QuantityParse(format!("invalid number in {raw}")))?;

        let multiplier: u64 = match suffix {
            "" => 1,
            "Ki" => 1 << 10,
            "Mi" => 1 << 20,
            "Gi" => 1 << 30,
            "Ti" => 1 << 40,
            "Pi" => 1 << 50,
            "Ei" => 1 << 60,
            "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            "P" => 1_000_000_000_000_000,
            "E" => 1_000_000_000_000_000_000,
            _ => {
                return Err(Error::QuantityParse(format!(
                    "unknown unit suffix {suffix} in {raw}"
                )))
            }
        };

        let bytes = value
            .checked_mul(multiplier)
            .ok_or_else(|| Error::QuantityParse(format!("quantity {raw} overflows")))?;

        Ok(Self {
            raw: raw.to_string(),
            bytes,
        })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Quantity {}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(q("100").bytes(), 100);
        assert_eq!(q("1Ki").bytes(), 1024);
        assert_eq!(q("10Mi").bytes(), 10 * 1024 * 1024);
        assert_eq!(q("50Gi").bytes(), 50 * 1024 * 1024 * 1024);
        assert_eq!(q("1k").bytes(), 1000);
        assert_eq!(q("1G").bytes(), 1_000_000_000);

        assert!("".parse::<Quantity>().is_err());
        assert!("abc".parse::<Quantity>().is_err());
        assert!("100X".parse::<Quantity>().is_err());
        assert!("ten".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(q("10Mi").to_string(), "10Mi");
        assert_eq!(q(" 50Gi ").to_string(), "50Gi");
        assert_eq!(Quantity::from_mib(128).to_string(), "128Mi");
    }

    #[test]
    fn test_equality_on_bytes() {
        assert_eq!(q("1Ki"), q("1024"));
        assert_ne!(q("1Ki"), q("1k"));
    }

    #[test]
    fn test_mebibytes() {
        assert_eq!(q("128Mi").mebibytes(), 128);
        assert_eq!(q("1Gi").mebibytes(), 1024);
        assert_eq!(Quantity::from_mib(10).mebibytes(), 10);
    }
}
