//! Phone-key normalization and validation.
//!
//! Keys are Vietnamese mobile numbers in local form: a leading zero, a
//! valid carrier prefix, seven more digits.

use std::sync::LazyLock;

use regex::Regex;

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0?)(3[2-9]|5[5689]|7[06789]|8[0-7689]|9[0-46-9])[0-9]{7}$")
        .expect("key pattern is valid")
});

pub fn is_valid_key(key: &str) -> bool {
    KEY_RE.is_match(key)
}

/// Normalize a raw key: strip non-digits, restore a missing leading zero,
/// fold the `84` country prefix into local form. Does not validate.
pub fn normalize_key(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 9 {
        return format!("0{digits}");
    }
    if let Some(rest) = digits.strip_prefix("84") {
        return format!("0{rest}");
    }
    digits
}

/// Numeric interpretation of a key, for deterministic ordering. The
/// leading zero is insignificant, matching a cast-to-integer sort.
pub fn key_ordinal(key: &str) -> u128 {
    key.chars()
        .filter(|c| c.is_ascii_digit())
        .fold(0u128, |acc, c| acc * 10 + (c as u128 - '0' as u128))
}
