#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "palaver"
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("username is invalid")]
    InvalidUsername,
    #[error("email is invalid")]
    InvalidEmail,
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("name is invalid")]
    InvalidName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_username(&value)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Email(String);

impl Email {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_email(&value)?;
        Ok(Self(value))
    }
}

fn validate_username(value: &str) -> Result<(), DomainError> {
    let char_count = value.chars().count();
    if char_count == 0 || char_count > 150 {
        return Err(DomainError::InvalidUsername);
    }
    let valid = value
        .chars()
        .all(|ch| ch.is_alphanumeric() || matches!(ch, '@' | '.' | '+' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidUsername)
    }
}

fn validate_email(value: &str) -> Result<(), DomainError> {
    if value.is_empty() || value.len() > 254 || value.chars().any(char::is_whitespace) {
        return Err(DomainError::InvalidEmail);
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err(DomainError::InvalidEmail);
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(DomainError::InvalidEmail);
    }
    Ok(())
}

/// Validates a free-form profile field (first name, last name, caption).
///
/// # Errors
/// Returns `DomainError::InvalidName` when the value exceeds `max_chars` or
/// contains control characters.
pub fn validate_profile_field(value: &str, max_chars: usize) -> Result<(), DomainError> {
    if value.chars().count() > max_chars || value.chars().any(char::is_control) {
        return Err(DomainError::InvalidName);
    }
    Ok(())
}

/// Splits a search keyword into match terms.
///
/// Double-quoted substrings are kept verbatim as single terms; unquoted text
/// is split on whitespace. Runs of two or more whitespace characters inside a
/// quoted term collapse to a single space. An unbalanced trailing quote is
/// treated as unquoted text.
#[must_use]
pub fn normalize_search_terms(keyword: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut rest = keyword;
    loop {
        let Some(open) = rest.find('"') else {
            break;
        };
        push_unquoted_terms(&rest[..open], &mut terms);
        let after = &rest[open + 1..];
        let Some(close) = after.find('"') else {
            rest = after;
            break;
        };
        let quoted = collapse_whitespace_runs(&after[..close]);
        if !quoted.is_empty() {
            terms.push(quoted);
        }
        rest = &after[close + 1..];
    }
    push_unquoted_terms(rest, &mut terms);
    terms
}

fn push_unquoted_terms(value: &str, terms: &mut Vec<String>) {
    for token in value.split_whitespace() {
        terms.push(token.to_owned());
    }
}

fn collapse_whitespace_runs(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut run_len = 0_usize;
    let mut run_char = ' ';
    for ch in value.chars() {
        if ch.is_whitespace() {
            run_len += 1;
            run_char = ch;
        } else {
            flush_whitespace_run(&mut out, run_len, run_char);
            run_len = 0;
            out.push(ch);
        }
    }
    flush_whitespace_run(&mut out, run_len, run_char);
    out
}

fn flush_whitespace_run(out: &mut String, run_len: usize, run_char: char) {
    if run_len >= 2 {
        out.push(' ');
    } else if run_len == 1 {
        out.push(run_char);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        normalize_search_terms, validate_profile_field, DomainError, Email, UserId, Username,
    };

    #[test]
    fn user_id_round_trips_through_text() {
        let id = UserId::new();
        let parsed = UserId::try_from(id.to_string()).expect("id should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn user_id_rejects_garbage() {
        assert_eq!(
            UserId::try_from(String::from("not-a-ulid")),
            Err(DomainError::InvalidUserId)
        );
    }

    #[test]
    fn username_accepts_django_style_characters() {
        for candidate in ["adefemi", "vester.mango", "user+tag@host", "a_b-c"] {
            assert!(Username::try_from(String::from(candidate)).is_ok());
        }
    }

    #[test]
    fn username_rejects_empty_and_spaces() {
        assert!(Username::try_from(String::new()).is_err());
        assert!(Username::try_from(String::from("two words")).is_err());
        assert!(Username::try_from("x".repeat(151)).is_err());
    }

    #[test]
    fn email_requires_local_and_domain_parts() {
        assert!(Email::try_from(String::from("adefemi@example.com")).is_ok());
        assert!(Email::try_from(String::from("missing-at.example.com")).is_err());
        assert!(Email::try_from(String::from("@example.com")).is_err());
        assert!(Email::try_from(String::from("user@")).is_err());
        assert!(Email::try_from(String::from("sp ace@example.com")).is_err());
    }

    #[test]
    fn profile_field_rejects_control_characters() {
        assert!(validate_profile_field("Oseni", 150).is_ok());
        assert!(validate_profile_field("tab\there", 150).is_err());
        assert!(validate_profile_field(&"x".repeat(151), 150).is_err());
    }

    #[test]
    fn unquoted_keywords_split_on_whitespace() {
        assert_eq!(
            normalize_search_terms("adefemi   oseni"),
            vec![String::from("adefemi"), String::from("oseni")]
        );
    }

    #[test]
    fn quoted_substrings_stay_single_terms() {
        assert_eq!(
            normalize_search_terms(r#"lead "adefemi oseni" dev"#),
            vec![
                String::from("lead"),
                String::from("adefemi oseni"),
                String::from("dev")
            ]
        );
    }

    #[test]
    fn whitespace_runs_inside_quotes_collapse() {
        assert_eq!(
            normalize_search_terms(r#""adefemi    oseni""#),
            vec![String::from("adefemi oseni")]
        );
    }

    #[test]
    fn unbalanced_quote_falls_back_to_unquoted_tokens() {
        assert_eq!(
            normalize_search_terms(r#"adefemi "oseni"#),
            vec![String::from("adefemi"), String::from("oseni")]
        );
    }

    #[test]
    fn empty_keyword_yields_no_terms() {
        assert!(normalize_search_terms("").is_empty());
        assert!(normalize_search_terms("   ").is_empty());
        assert!(normalize_search_terms(r#""""#).is_empty());
    }
}
