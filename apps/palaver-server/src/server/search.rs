use std::collections::HashMap;
use std::fmt::Write as _;

use palaver_core::normalize_search_terms;

use super::errors::ApiFailure;

/// Query keys that may be used as exact-match filters on the profile
/// listing. Anything else (apart from `search` and `page`) is rejected so
/// callers cannot filter on arbitrary columns.
const EXACT_FILTER_FIELDS: [ExactField; 3] =
    [ExactField::FirstName, ExactField::LastName, ExactField::Caption];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExactField {
    FirstName,
    LastName,
    Caption,
}

impl ExactField {
    fn query_key(self) -> &'static str {
        match self {
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Caption => "caption",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::FirstName => "p.first_name",
            Self::LastName => "p.last_name",
            Self::Caption => "p.caption",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ProfileSearchQuery {
    pub(crate) terms: Vec<String>,
    pub(crate) exact: Vec<(ExactField, String)>,
    pub(crate) page: usize,
}

/// Parses the profile listing query string. `search` feeds the tokenizer,
/// `page` selects the result page and never acts as a column filter, and
/// the remaining keys must come from the exact-filter allow list.
pub(crate) fn parse_profile_search(
    params: &HashMap<String, String>,
) -> Result<ProfileSearchQuery, ApiFailure> {
    let mut terms = Vec::new();
    let mut exact = Vec::new();
    let mut page = 1_usize;

    for (key, value) in params {
        match key.as_str() {
            "search" => {
                terms = normalize_search_terms(value);
            }
            "page" => {
                page = value
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|parsed| *parsed >= 1)
                    .ok_or(ApiFailure::InvalidRequest)?;
            }
            other => {
                let field = EXACT_FILTER_FIELDS
                    .into_iter()
                    .find(|field| field.query_key() == other)
                    .ok_or(ApiFailure::InvalidRequest)?;
                exact.push((field, value.clone()));
            }
        }
    }

    exact.sort_by_key(|(field, _)| field.query_key());
    Ok(ProfileSearchQuery { terms, exact, page })
}

pub(crate) struct SearchCandidate<'a> {
    pub(crate) username: &'a str,
    pub(crate) email: &'a str,
    pub(crate) first_name: &'a str,
    pub(crate) last_name: &'a str,
    pub(crate) caption: &'a str,
}

/// Every term must hit at least one of the searchable fields, matching the
/// SQL path's AND-of-ORs shape.
pub(crate) fn candidate_matches_terms(candidate: &SearchCandidate<'_>, terms: &[String]) -> bool {
    terms.iter().all(|term| {
        let needle = term.to_lowercase();
        [
            candidate.username,
            candidate.email,
            candidate.first_name,
            candidate.last_name,
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
    })
}

pub(crate) fn candidate_matches_exact(
    candidate: &SearchCandidate<'_>,
    exact: &[(ExactField, String)],
) -> bool {
    exact.iter().all(|(field, expected)| {
        let actual = match field {
            ExactField::FirstName => candidate.first_name,
            ExactField::LastName => candidate.last_name,
            ExactField::Caption => candidate.caption,
        };
        actual == expected
    })
}

pub(crate) fn page_bounds(page: usize, page_size: usize) -> (usize, usize) {
    (page.saturating_sub(1).saturating_mul(page_size), page_size)
}

fn escape_like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Builds the Postgres listing query. `$1` is the requesting user's id
/// (used for both self-exclusion and the favorite join); text parameters
/// for terms and exact filters follow in order, and the final two numbered
/// parameters are the `i64` limit and offset. The caller binds in exactly
/// that order.
pub(crate) fn build_profile_search_sql(search: &ProfileSearchQuery) -> (String, Vec<String>) {
    let mut sql = String::from(
        "SELECT p.profile_id, p.user_id, u.username, u.last_seen_unix,
                p.first_name, p.last_name, p.caption, p.about, p.picture_file_id,
                p.created_at_unix, p.updated_at_unix,
                CASE WHEN f.favorite_user_id IS NULL THEN 0 ELSE 1 END AS favorite_rank
         FROM profiles p
         JOIN users u ON u.user_id = p.user_id
         LEFT JOIN favorites f
             ON f.owner_user_id = $1 AND f.favorite_user_id = p.user_id
         WHERE u.is_active AND NOT u.is_superuser AND p.user_id <> $1",
    );
    let mut params = Vec::new();
    let mut next_placeholder = 2_usize;

    for term in &search.terms {
        let placeholder = next_placeholder;
        next_placeholder += 1;
        let _ = write!(
            sql,
            " AND (u.username ILIKE ${placeholder} OR u.email ILIKE ${placeholder}
                OR p.first_name ILIKE ${placeholder} OR p.last_name ILIKE ${placeholder})"
        );
        params.push(format!("%{}%", escape_like_pattern(term)));
    }

    for (field, value) in &search.exact {
        let placeholder = next_placeholder;
        next_placeholder += 1;
        let _ = write!(sql, " AND {} = ${placeholder}", field.column());
        params.push(value.clone());
    }

    let limit_placeholder = next_placeholder;
    let offset_placeholder = next_placeholder + 1;
    let _ = write!(
        sql,
        " ORDER BY favorite_rank DESC, p.profile_id ASC
          LIMIT ${limit_placeholder} OFFSET ${offset_placeholder}"
    );

    (sql, params)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        build_profile_search_sql, candidate_matches_exact, candidate_matches_terms, page_bounds,
        parse_profile_search, ExactField, ProfileSearchQuery, SearchCandidate,
    };

    fn params(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn candidate<'a>() -> SearchCandidate<'a> {
        SearchCandidate {
            username: "adefemi",
            email: "adefemi@example.com",
            first_name: "Adefemi",
            last_name: "Oseni",
            caption: "builder",
        }
    }

    #[test]
    fn terms_must_all_match_somewhere() {
        let both = vec![String::from("ade"), String::from("oseni")];
        assert!(candidate_matches_terms(&candidate(), &both));

        let miss = vec![String::from("ade"), String::from("zzz")];
        assert!(!candidate_matches_terms(&candidate(), &miss));
    }

    #[test]
    fn term_matching_ignores_case() {
        let terms = vec![String::from("OSENI")];
        assert!(candidate_matches_terms(&candidate(), &terms));
    }

    #[test]
    fn exact_filters_are_case_sensitive_equality() {
        let hit = vec![(ExactField::Caption, String::from("builder"))];
        assert!(candidate_matches_exact(&candidate(), &hit));

        let near_miss = vec![(ExactField::Caption, String::from("Builder"))];
        assert!(!candidate_matches_exact(&candidate(), &near_miss));

        let substring = vec![(ExactField::FirstName, String::from("Ade"))];
        assert!(!candidate_matches_exact(&candidate(), &substring));
    }

    #[test]
    fn page_is_pagination_not_a_filter() {
        let search = parse_profile_search(&params(&[("search", "ade"), ("page", "3")]))
            .expect("query should parse");
        assert_eq!(search.page, 3);
        assert_eq!(search.terms, vec![String::from("ade")]);
        assert!(search.exact.is_empty());
    }

    #[test]
    fn unknown_filter_keys_are_rejected() {
        assert!(parse_profile_search(&params(&[("is_superuser", "false")])).is_err());
        assert!(parse_profile_search(&params(&[("page", "0")])).is_err());
        assert!(parse_profile_search(&params(&[("page", "soon")])).is_err());
    }

    #[test]
    fn allow_listed_exact_filters_parse() {
        let search = parse_profile_search(&params(&[("first_name", "Adefemi"), ("caption", "x")]))
            .expect("query should parse");
        assert_eq!(search.exact.len(), 2);
        assert!(search
            .exact
            .contains(&(ExactField::FirstName, String::from("Adefemi"))));
        assert!(search.exact.contains(&(ExactField::Caption, String::from("x"))));
    }

    #[test]
    fn page_bounds_are_zero_based_offsets() {
        assert_eq!(page_bounds(1, 20), (0, 20));
        assert_eq!(page_bounds(3, 20), (40, 20));
    }

    #[test]
    fn sql_builder_numbers_parameters_in_bind_order() {
        let search = ProfileSearchQuery {
            terms: vec![String::from("ade"), String::from("50%_off")],
            exact: vec![(ExactField::Caption, String::from("builder"))],
            page: 2,
        };
        let (sql, params) = build_profile_search_sql(&search);

        assert!(sql.contains("ILIKE $2"));
        assert!(sql.contains("ILIKE $3"));
        assert!(sql.contains("p.caption = $4"));
        assert!(sql.contains("LIMIT $5 OFFSET $6"));
        assert!(sql.contains("ORDER BY favorite_rank DESC, p.profile_id ASC"));
        assert_eq!(
            params,
            vec![
                String::from("%ade%"),
                String::from("%50\\%\\_off%"),
                String::from("builder"),
            ]
        );
    }

    #[test]
    fn sql_builder_excludes_self_and_superusers() {
        let search = ProfileSearchQuery {
            terms: Vec::new(),
            exact: Vec::new(),
            page: 1,
        };
        let (sql, params) = build_profile_search_sql(&search);
        assert!(sql.contains("NOT u.is_superuser"));
        assert!(sql.contains("p.user_id <> $1"));
        assert!(sql.contains("LIMIT $2 OFFSET $3"));
        assert!(params.is_empty());
    }
}
