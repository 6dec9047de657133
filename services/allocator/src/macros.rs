//! `$NAME` / `${NAME}` expansion for user-supplied values.
//!
//! Build URLs and filters are usually parameterized by the CI job, e.g.
//! `https://builds/${BUILD_ID}/b2g.zip`. References to unknown variables
//! and malformed references are left verbatim.

use std::collections::HashMap;

/// Expand references in `text` from `vars`.
pub fn expand(text: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_name(&braced[..end]) => (&braced[..end], end + 2),
                _ => ("", 0),
            }
        } else {
            let len = name_len(after);
            (&after[..len], len)
        };

        match vars.get(name) {
            Some(value) if consumed > 0 => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Expand against the process environment.
pub fn expand_env(text: &str) -> String {
    let vars: HashMap<String, String> = std::env::vars().collect();
    expand(text, &vars)
}

fn name_len(s: &str) -> usize {
    let mut len = 0;
    for (i, c) in s.char_indices() {
        let valid = if i == 0 {
            c == '_' || c.is_ascii_alphabetic()
        } else {
            c == '_' || c.is_ascii_alphanumeric()
        };
        if !valid {
            break;
        }
        len = i + c.len_utf8();
    }
    len
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && name_len(s) == s.len()
}
