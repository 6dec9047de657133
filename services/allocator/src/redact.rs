//! Strip `bewit` access tokens from URLs before they reach a log.

const BEWIT: &str = "bewit=";

/// Remove every `bewit=...` query argument, dropping the `?` when nothing
/// else is left.
pub fn remove_bewit(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|arg| !arg.is_empty() && !arg.starts_with(BEWIT))
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const URL: &str = "https://domain-name.tld/resource";

    #[rstest]
    #[case("", "")]
    #[case("?oneParam=1", "?oneParam=1")]
    #[case("?bewit=my-bewit", "")]
    #[case("?oneParam=1&bewit=my-bewit&otherParam=2", "?oneParam=1&otherParam=2")]
    #[case("?bewit=my-bewit&oneParam=1", "?oneParam=1")]
    #[case("?oneParam=1&bewit=my-bewit", "?oneParam=1")]
    fn test_remove_bewit(#[case] query: &str, #[case] expected: &str) {
        let url = format!("{}{}", URL, query);
        assert_eq!(remove_bewit(&url), format!("{}{}", URL, expected));
    }
}
