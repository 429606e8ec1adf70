use crate::error::{PanelError, PanelResult};

/// Digits in a full national number (two-digit area code plus an 8 or 9
/// digit subscriber number).
const NATIONAL_MIN_DIGITS: usize = 10;
const NATIONAL_MAX_DIGITS: usize = 11;

/// Canonical conversation key for a phone-like identifier.
///
/// Drops any `@domain` suffix and keeps ASCII digits. A full national number
/// gets `country_code` in front; digits longer than any national number are
/// taken to carry it already. Area code 55 therefore never passes for country
/// code 55. Digit runs too short to hold an area code are left as they are,
/// which keeps the function idempotent. Returns an empty string when no
/// digits remain.
pub fn normalize_wa_id(raw: &str, country_code: &str) -> String {
    let local = raw.split('@').next().unwrap_or("");
    let digits = local
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.len() < NATIONAL_MIN_DIGITS {
        return digits;
    }
    if digits.len() > NATIONAL_MAX_DIGITS && digits.starts_with(country_code) {
        digits
    } else {
        format!("{country_code}{digits}")
    }
}

/// `normalize_wa_id` for request input: no digits is `InvalidInput`.
pub fn canonical_wa_id(raw: &str, country_code: &str) -> PanelResult<String> {
    let wa_id = normalize_wa_id(raw, country_code);
    if wa_id.is_empty() {
        return Err(PanelError::InvalidInput(format!(
            "'{raw}' is not a phone number"
        )));
    }
    Ok(wa_id)
}
