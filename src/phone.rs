//! Phone number validation, normalization and display formatting.
//!
//! Stored numbers are digit-only E.164 with a leading `+`. Display formatting
//! is purely cosmetic and never feeds equality or storage.

/// E.164 national-significant-number bounds.
const MIN_DIGITS: usize = 10;
const MAX_DIGITS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneValidation {
    pub is_valid: bool,
    pub formatted: Option<String>,
    pub error: Option<String>,
}

impl PhoneValidation {
    fn valid(formatted: String) -> Self {
        Self {
            is_valid: true,
            formatted: Some(formatted),
            error: None,
        }
    }

    fn invalid(error: &str) -> Self {
        Self {
            is_valid: false,
            formatted: None,
            error: Some(error.to_string()),
        }
    }
}

/// Validate a raw phone number and normalize it to `+`-prefixed E.164.
#[must_use]
pub fn validate(raw: &str) -> PhoneValidation {
    if raw.trim().is_empty() {
        return PhoneValidation::invalid("Phone number is required");
    }

    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_DIGITS {
        return PhoneValidation::invalid("Phone number must have at least 10 digits");
    }
    if digits.len() > MAX_DIGITS {
        return PhoneValidation::invalid("Phone number must have no more than 15 digits");
    }

    PhoneValidation::valid(format!("+{digits}"))
}

/// Strip everything except digits and a leading `+`. No length validation;
/// used before [`validate`] and to normalize stored values.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if trimmed.starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

/// Compare two numbers on their digit-only forms, ignoring punctuation and
/// the `+` prefix.
#[must_use]
pub fn equal(a: &str, b: &str) -> bool {
    let digits = |value: &str| -> String { value.chars().filter(char::is_ascii_digit).collect() };
    let (a, b) = (digits(a), digits(b));
    !a.is_empty() && a == b
}

/// Best-effort human formatting: US/Canada numbers get the familiar grouping,
/// everything else falls back to the `+`-prefixed digits.
#[must_use]
pub fn format_for_display(e164: &str) -> String {
    let digits: String = e164.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        let area = &digits[1..4];
        let prefix = &digits[4..7];
        let line = &digits[7..11];
        return format!("+1 ({area}) {prefix}-{line}");
    }
    if digits.is_empty() {
        return String::new();
    }
    format!("+{digits}")
}

/// Masked form safe for logs and notification text: only the trailing four
/// digits survive.
#[must_use]
pub fn format_masked(e164: &str) -> String {
    let digits: String = e164.chars().filter(char::is_ascii_digit).collect();
    if digits.len() <= 4 {
        return format!("+{}", "*".repeat(digits.len()));
    }
    let tail = &digits[digits.len() - 4..];
    format!("+{}{tail}", "*".repeat(digits.len() - 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_punctuated_us_number() {
        let result = validate("+1 (234) 567-8900");
        assert!(result.is_valid);
        assert_eq!(result.formatted.as_deref(), Some("+12345678900"));
        assert_eq!(result.error, None);
    }

    #[test]
    fn validate_rejects_empty_with_required_message() {
        let result = validate("   ");
        assert!(!result.is_valid);
        assert_eq!(result.error.as_deref(), Some("Phone number is required"));
    }

    #[test]
    fn validate_rejects_short_numbers() {
        let result = validate("123-4567");
        assert!(!result.is_valid);
        assert!(result.error.is_some_and(|msg| msg.contains("10 digits")));
    }

    #[test]
    fn validate_rejects_long_numbers() {
        let result = validate("1234567890123456");
        assert!(!result.is_valid);
        assert!(result.error.is_some_and(|msg| msg.contains("15 digits")));
    }

    #[test]
    fn validate_boundaries_are_inclusive() {
        assert!(validate("1234567890").is_valid);
        assert!(validate("123456789012345").is_valid);
    }

    #[test]
    fn sanitize_keeps_leading_plus_only() {
        assert_eq!(sanitize("+1 (234) 567-8900"), "+12345678900");
        assert_eq!(sanitize("(234) 567-8900"), "2345678900");
        assert_eq!(sanitize("2+34"), "234");
    }

    #[test]
    fn equal_ignores_punctuation_and_plus() {
        assert!(equal("+1 (234) 567-8900", "12345678900"));
        assert!(equal("234.567.8900", "(234) 567-8900"));
        assert!(!equal("12345678900", "12345678901"));
        assert!(!equal("", ""));
    }

    #[test]
    fn display_formats_nanp_numbers() {
        assert_eq!(format_for_display("+12345678900"), "+1 (234) 567-8900");
    }

    #[test]
    fn display_falls_back_to_plus_digits() {
        assert_eq!(format_for_display("+447911123456"), "+447911123456");
    }

    #[test]
    fn masked_form_keeps_last_four() {
        assert_eq!(format_masked("+12345678900"), "+*******8900");
    }
}
