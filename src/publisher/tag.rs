//! Tag-to-version extraction.
//!
//! Link configurations carry a glob-like tag pattern (default `v*`). The
//! pattern compiles to an anchored regex with `*` as a capture group; the
//! first capture, stripped of a leading `v`, must be a valid semver or the
//! tag is silently skipped.

use regex::Regex;

/// Extract the published version from a tag name, or `None` when the tag
/// does not match the pattern or is not a valid semver.
pub fn extract_version_from_tag(tag: &str, pattern: &str) -> Option<String> {
    let parts: Vec<String> = pattern.split('*').map(|p| regex::escape(p)).collect();
    let regex_src = if parts.len() == 1 {
        // Pattern without any `*` captures the whole tag.
        format!("^({})$", parts[0])
    } else {
        format!("^{}$", parts.join("(.*)"))
    };

    let regex = Regex::new(&regex_src).ok()?;
    let captures = regex.captures(tag)?;
    let candidate = captures.get(1)?.as_str();
    let version = candidate.strip_prefix('v').unwrap_or(candidate);
    if !crate::semver::is_valid(version) {
        return None;
    }
    Some(version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern() {
        assert_eq!(
            extract_version_from_tag("v1.2.3", "v*"),
            Some("1.2.3".to_string())
        );
        assert_eq!(
            extract_version_from_tag("v1.2.3-rc1", "v*"),
            Some("1.2.3-rc1".to_string())
        );
        assert_eq!(
            extract_version_from_tag("v0.1.0+build-7", "v*"),
            Some("0.1.0+build-7".to_string())
        );
    }

    #[test]
    fn test_non_matching_tags_skipped() {
        assert_eq!(extract_version_from_tag("release-1.2.3", "v*"), None);
        assert_eq!(extract_version_from_tag("v1.2", "v*"), None);
        assert_eq!(extract_version_from_tag("vabc", "v*"), None);
        assert_eq!(extract_version_from_tag("v1.2.3_hotfix", "v*"), None);
    }

    #[test]
    fn test_custom_prefix_pattern() {
        assert_eq!(
            extract_version_from_tag("release/2.0.0", "release/*"),
            Some("2.0.0".to_string())
        );
        assert_eq!(extract_version_from_tag("v2.0.0", "release/*"), None);
    }

    #[test]
    fn test_bare_version_pattern() {
        // `*` alone accepts bare and v-prefixed semver tags.
        assert_eq!(
            extract_version_from_tag("1.0.0", "*"),
            Some("1.0.0".to_string())
        );
        assert_eq!(
            extract_version_from_tag("v1.0.0", "*"),
            Some("1.0.0".to_string())
        );
    }
}
