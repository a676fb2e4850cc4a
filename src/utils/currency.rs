/// Money helpers.
///
/// Amounts are exact decimals with two fractional digits inside the service;
/// the payment processor speaks integer minor units (1 unit = 100 minor).
use bigdecimal::BigDecimal;
use num_traits::{ToPrimitive, Zero};

/// Convert a decimal amount to minor units. `None` when the amount has more
/// than two fractional digits or does not fit in an i64.
pub fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    let scaled = amount.clone() * BigDecimal::from(100);
    if scaled.with_scale(0) != scaled {
        return None;
    }
    scaled.to_i64()
}

/// Convert minor units to a decimal amount with two fractional digits.
pub fn from_minor_units(minor: i64) -> BigDecimal {
    (BigDecimal::from(minor) / BigDecimal::from(100)).with_scale(2)
}

/// Positive with at most two fractional digits.
pub fn is_valid_amount(amount: &BigDecimal) -> bool {
    *amount > BigDecimal::zero() && amount.with_scale(2) == *amount
}

pub fn is_valid_currency(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

/// Splits `amount` into the part released to the freelancer
/// (`round(amount * pct / 100, 2)`) and the remainder refunded to the client.
/// The two parts always sum to `amount`.
pub fn split_by_percentage(amount: &BigDecimal, freelancer_pct: u8) -> (BigDecimal, BigDecimal) {
    let released = (amount.clone() * BigDecimal::from(i64::from(freelancer_pct)) / BigDecimal::from(100)).round(2);
    let refunded = amount.clone() - released.clone();
    (released, refunded)
}

pub fn format_amount(amount: &BigDecimal, currency: &str) -> String {
    format!("{} {}", amount.with_scale(2), currency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    #[test]
    fn test_to_minor_units() {
        assert_eq!(to_minor_units(&dec("100")), Some(10000));
        assert_eq!(to_minor_units(&dec("0.50")), Some(50));
        assert_eq!(to_minor_units(&dec("123.45")), Some(12345));
        assert_eq!(to_minor_units(&dec("1.005")), None);
    }

    #[test]
    fn test_from_minor_units() {
        assert_eq!(from_minor_units(10000), dec("100"));
        assert_eq!(from_minor_units(50), dec("0.5"));
        assert_eq!(from_minor_units(12345), dec("123.45"));
    }

    #[test]
    fn test_is_valid_amount() {
        assert!(is_valid_amount(&dec("0.01")));
        assert!(is_valid_amount(&dec("500")));
        assert!(!is_valid_amount(&dec("0")));
        assert!(!is_valid_amount(&dec("-3")));
        assert!(!is_valid_amount(&dec("9.999")));
    }

    #[test]
    fn test_is_valid_currency() {
        assert!(is_valid_currency("USD"));
        assert!(!is_valid_currency("usd"));
        assert!(!is_valid_currency("US"));
    }

    #[test]
    fn test_split_by_percentage() {
        let (released, refunded) = split_by_percentage(&dec("500"), 60);
        assert_eq!(released, dec("300"));
        assert_eq!(refunded, dec("200"));

        // rounding never loses a cent
        let (released, refunded) = split_by_percentage(&dec("100.01"), 33);
        assert_eq!(released, dec("33.00"));
        assert_eq!(released + refunded, dec("100.01"));
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(&dec("12.5"), "USD"), "12.50 USD");
    }
}
