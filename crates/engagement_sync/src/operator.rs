//! Mobile network operator lookup from participant contact URNs.

const SOMALIA_COUNTRY_CODE: &str = "252";

/// Somali mobile prefixes (first two digits after the country code).
const SOMALIA_PREFIXES: &[(&str, &str)] = &[
    ("61", "hormud"),
    ("77", "hormud"),
    ("62", "somtel"),
    ("65", "somtel"),
    ("66", "somtel"),
    ("63", "telesom"),
    ("90", "golis"),
    ("68", "nationlink"),
    ("69", "nationlink"),
];

pub const OTHER_OPERATOR: &str = "other";

/// Operator for a contact such as `tel:+252612345678`.
///
/// Returns `None` when the contact is not a phone number. Numbers outside
/// Somalia, or with an unknown prefix, map to [`OTHER_OPERATOR`].
pub fn operator_for_contact(contact: &str) -> Option<&'static str> {
    let number = contact.trim();
    let number = number.strip_prefix("tel:").unwrap_or(number);
    let number = number.strip_prefix('+').unwrap_or(number);
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let Some(local) = number.strip_prefix(SOMALIA_COUNTRY_CODE) else {
        return Some(OTHER_OPERATOR);
    };
    let operator = local
        .get(..2)
        .and_then(|prefix| SOMALIA_PREFIXES.iter().find(|(p, _)| *p == prefix))
        .map_or(OTHER_OPERATOR, |(_, operator)| operator);
    Some(operator)
}
