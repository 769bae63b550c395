//! Naming conventions: default store names from model names (PascalCase -> snake_case) and
//! result keys for JSON rendering (PascalCase -> camelCase).

use serde::{Deserialize, Serialize};

/// How table and column names are derived when the model configuration does not set them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    /// Store names equal the model names.
    #[default]
    AsIs,
    /// `BlogPost.CreatedAt` -> `blog_post.created_at`.
    SnakeCase,
}

impl NamingConvention {
    pub fn apply(&self, name: &str) -> String {
        match self {
            NamingConvention::AsIs => name.to_string(),
            NamingConvention::SnakeCase => to_snake_case(name),
        }
    }
}

/// Convert a PascalCase or camelCase identifier to snake_case.
/// Acronym runs stay together: "HTTPCode" -> "http_code", "BlogId" -> "blog_id".
pub fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if i > 0 && chars[i - 1] != '_' && (prev_lower || (prev_upper && next_lower)) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Lower-case the leading character (or leading acronym) of a PascalCase member name.
/// "Name" -> "name", "ID" -> "id", "URLPath" -> "urlPath".
pub fn to_camel_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() && chars[i].is_uppercase() {
        let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
        if i > 0 && next_lower {
            break;
        }
        out.extend(chars[i].to_lowercase());
        i += 1;
    }
    out.extend(&chars[i..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("BlogId", "blog_id")]
    #[test_case("HTTPCode", "http_code")]
    #[test_case("Name", "name")]
    #[test_case("already_snake", "already_snake")]
    #[test_case("Address2Line", "address2_line")]
    fn snake_case(input: &str, expected: &str) {
        assert_eq!(to_snake_case(input), expected);
    }

    #[test_case("Name", "name")]
    #[test_case("ID", "id")]
    #[test_case("URLPath", "urlPath")]
    #[test_case("blogId", "blogId")]
    fn camel_case(input: &str, expected: &str) {
        assert_eq!(to_camel_case(input), expected);
    }

    #[test]
    fn convention_applies() {
        assert_eq!(NamingConvention::SnakeCase.apply("CreatedAt"), "created_at");
        assert_eq!(NamingConvention::AsIs.apply("CreatedAt"), "CreatedAt");
    }
}
