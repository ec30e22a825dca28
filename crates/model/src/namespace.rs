use crate::destination::DestinationKind;

/// Longest namespace any supported warehouse accepts.
const MAX_NAMESPACE_LENGTH: usize = 127;

/// Identifiers that cannot be used bare as a schema name in at least one of
/// the supported warehouses; they get a leading underscore.
const RESERVED_KEYWORDS: [&str; 12] = [
    "AS", "BY", "CASE", "DEFAULT", "FROM", "GROUP", "ORDER", "SELECT", "TABLE",
    "USER", "WHERE", "WITH",
];

/// Reduce an arbitrary display name to a namespace every warehouse accepts:
/// keep alphanumeric runs, join them with underscores, snake-case the result,
/// and guard against leading digits, emptiness and reserved words.
pub fn to_safe_namespace(kind: DestinationKind, name: &str) -> String {
    let mut runs: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }

    let mut namespace = to_snake(&runs.join("_"));

    if namespace.starts_with(|c: char| c.is_ascii_digit()) {
        namespace.insert(0, '_');
    }
    if namespace.is_empty() {
        namespace = "stringempty".to_string();
    }
    if RESERVED_KEYWORDS.contains(&namespace.to_uppercase().as_str()) {
        namespace.insert(0, '_');
    }

    namespace.truncate(MAX_NAMESPACE_LENGTH);
    to_provider_case(kind, &namespace)
}

/// Apply the destination's identifier case rules.
pub fn to_provider_case(kind: DestinationKind, s: &str) -> String {
    if kind.uppercases_namespace() {
        s.to_uppercase()
    } else {
        s.to_string()
    }
}

fn to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_lower_or_digit = false;
    for c in s.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower_or_digit = false;
        } else {
            out.push(c);
            prev_lower_or_digit = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_special_characters() {
        assert_eq!(
            to_safe_namespace(DestinationKind::Postgres, "omega to.my-hyphen"),
            "omega_to_my_hyphen"
        );
    }

    #[test]
    fn snake_cases_camel_names() {
        assert_eq!(
            to_safe_namespace(DestinationKind::Postgres, "CamelCase123Source"),
            "camel_case123_source"
        );
    }

    #[test]
    fn prefixes_leading_digit() {
        assert_eq!(
            to_safe_namespace(DestinationKind::Postgres, "1shop"),
            "_1shop"
        );
    }

    #[test]
    fn empty_name_gets_placeholder() {
        assert_eq!(
            to_safe_namespace(DestinationKind::Postgres, "..."),
            "stringempty"
        );
    }

    #[test]
    fn reserved_word_is_escaped() {
        assert_eq!(to_safe_namespace(DestinationKind::Postgres, "user"), "_user");
    }

    #[test]
    fn snowflake_namespaces_are_uppercased() {
        assert_eq!(
            to_safe_namespace(DestinationKind::Snowflake, "shop events"),
            "SHOP_EVENTS"
        );
    }
}
