//! Form-field name normalization. The alias table is the contract: lookup is
//! case- and dash-insensitive, unknown names pass through normalized.

use std::collections::HashMap;

use url::Url;

use crate::utm::TRACKING_PARAMS;

/// `{canonical_name → aliases}`. Aliases are matched after lowercasing and
/// hyphen→underscore folding.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    (
        "email",
        &[
            "email",
            "e_mail",
            "email_address",
            "emailaddress",
            "mail",
            "your_email",
            "user_email",
            "contact_email",
        ],
    ),
    (
        "first_name",
        &["first_name", "firstname", "fname", "given_name", "your_name"],
    ),
    (
        "last_name",
        &["last_name", "lastname", "lname", "surname", "family_name"],
    ),
    (
        "phone",
        &["phone", "tel", "telephone", "phone_number", "mobile"],
    ),
    (
        "company",
        &["company", "organization", "organisation", "company_name"],
    ),
    ("message", &["message", "comments", "your_message"]),
];

/// Canonical field name for a raw form parameter.
pub fn normalize_field_name(raw: &str) -> String {
    let folded = raw.trim().to_ascii_lowercase().replace('-', "_");
    for (canonical, aliases) in FIELD_ALIASES {
        if aliases.contains(&folded.as_str()) {
            return canonical.to_string();
        }
    }
    folded
}

/// Normalize every key of a submitted form map. Later duplicates of a
/// canonical name keep the first non-empty value.
pub fn normalize_form_map(raw: &HashMap<String, String>) -> HashMap<String, String> {
    let mut normalized = HashMap::new();
    for (key, value) in raw {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        normalized
            .entry(normalize_field_name(key))
            .or_insert_with(|| value.to_string());
    }
    normalized
}

/// Derive form fields from page-URL query parameters: everything outside the
/// recognized tracking set, normalized. Retained only when an `email` field
/// comes out the other side.
pub fn form_fields_from_url(page_url: &str) -> Option<HashMap<String, String>> {
    let parsed = Url::parse(page_url).ok()?;
    let mut fields = HashMap::new();
    for (key, value) in parsed.query_pairs() {
        let lowered = key.to_ascii_lowercase();
        if TRACKING_PARAMS.contains(&lowered.as_str()) {
            continue;
        }
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        fields
            .entry(normalize_field_name(&key))
            .or_insert_with(|| value.to_string());
    }
    fields.contains_key("email").then_some(fields)
}
