//! IMEI validation: syntax, Luhn checksum, and allow-list membership.
//!
//! Trackers identify themselves once per connection with a bare IMEI. A valid
//! IMEI is exactly 15 ASCII decimal digits whose Luhn mod-10 sum is zero.
//! The allow-list check only applies when the operator has enabled it; an
//! enabled but empty list admits nothing.

use std::collections::HashSet;

/// Rejection reasons surfaced to the handshake path and the `check-imei` CLI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImeiError {
    #[error("IMEI must be exactly 15 decimal digits")]
    BadFormat,

    #[error("IMEI fails the Luhn checksum")]
    BadLuhn,

    #[error("IMEI is not on the allow-list")]
    NotAllowed,
}

/// Syntactic check: exactly 15 ASCII decimal digits.
pub fn is_well_formed(imei: &str) -> bool {
    imei.len() == 15 && imei.bytes().all(|b| b.is_ascii_digit())
}

/// Luhn mod-10 over the decimal digits, right to left: every second digit is
/// doubled, digits above 9 have 9 subtracted, and the total must be 0 mod 10.
pub fn luhn_ok(imei: &str) -> bool {
    let mut sum = 0u32;
    for (i, b) in imei.bytes().rev().enumerate() {
        let mut d = (b - b'0') as u32;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

/// Full verdict: syntax, then checksum, then (optionally) allow-list.
pub fn validate(
    imei: &str,
    allow_enabled: bool,
    allow_list: &HashSet<String>,
) -> Result<(), ImeiError> {
    if !is_well_formed(imei) {
        return Err(ImeiError::BadFormat);
    }
    if !luhn_ok(imei) {
        return Err(ImeiError::BadLuhn);
    }
    if allow_enabled && !allow_list.contains(imei) {
        return Err(ImeiError::NotAllowed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn accepts_known_good_imei() {
        assert!(validate("353691844288760", false, &set(&[])).is_ok());
        assert!(validate("356307042441013", false, &set(&[])).is_ok());
    }

    #[test]
    fn rejects_luhn_failure() {
        // Last digit off by one from a valid IMEI
        assert_eq!(
            validate("353691844288761", false, &set(&[])),
            Err(ImeiError::BadLuhn)
        );
    }

    #[test]
    fn rejects_bad_format() {
        for bad in ["", "35369184428876", "3536918442887601", "35369184428876a", "35369184428 760"] {
            assert_eq!(validate(bad, false, &set(&[])), Err(ImeiError::BadFormat), "{bad:?}");
        }
    }

    #[test]
    fn allow_list_only_checked_when_enabled() {
        let list = set(&["353691844288760"]);
        assert!(validate("353691844288760", true, &list).is_ok());
        assert_eq!(
            validate("356307042441013", true, &list),
            Err(ImeiError::NotAllowed)
        );
        // Disabled list admits any valid IMEI
        assert!(validate("356307042441013", false, &list).is_ok());
    }

    #[test]
    fn enabled_empty_allow_list_denies_everything() {
        assert_eq!(
            validate("353691844288760", true, &set(&[])),
            Err(ImeiError::NotAllowed)
        );
    }

    #[test]
    fn luhn_transform_matches_hand_computation() {
        // 15-digit strings where the doubled-digit sum is known
        assert!(luhn_ok("000000000000000"));
        assert!(!luhn_ok("000000000000001"));
        assert!(luhn_ok("356307042441013"));
    }
}
