//! Channel Pattern Matching
//!
//! PSUBSCRIBE patterns are matched against channel names with a small glob
//! dialect:
//!
//! - `*` matches any run of characters (including none)
//! - `?` matches exactly one character
//! - `[ae]` matches one character from the set
//!
//! This matcher is used only for pub/sub channels; KEYS deliberately supports
//! nothing beyond the bare `*` pattern.

/// Returns true if `pattern` matches the whole of `text`.
///
/// Iterative two-pointer matcher with a single backtrack point: on a
/// mismatch after a `*`, the star swallows one more character and matching
/// resumes. Patterns come from PSUBSCRIBE clients, so the cost must stay
/// linear-ish even for adversarial runs of stars.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();

    let mut p = 0;
    let mut t = 0;
    // (pattern position after the star, text position it resumes from)
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        let step = match pattern.get(p) {
            Some(b'*') => {
                star = Some((p + 1, t));
                p += 1;
                continue;
            }
            Some(b'?') => Some(1),
            Some(b'[') => match pattern[p..].iter().position(|&b| b == b']') {
                Some(close) => {
                    let set = &pattern[p + 1..p + close];
                    set.contains(&text[t]).then_some(close + 1)
                }
                // Unterminated set: treat the bracket literally.
                None => (text[t] == b'[').then_some(1),
            },
            Some(&literal) => (text[t] == literal).then_some(1),
            None => None,
        };

        match (step, star) {
            (Some(advance), _) => {
                p += advance;
                t += 1;
            }
            // Reopen the last star over one more character.
            (None, Some((sp, st))) => {
                p = sp;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            (None, None) => return false,
        }
    }

    // Text is exhausted; only trailing stars may remain.
    pattern[p..].iter().all(|&b| b == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_everything() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn test_prefix_pattern() {
        assert!(glob_match("my.*", "my.channel"));
        assert!(glob_match("my.*", "my."));
        assert!(!glob_match("my.*", "your.channel"));
    }

    #[test]
    fn test_infix_star() {
        assert!(glob_match("h*llo", "hello"));
        assert!(glob_match("h*llo", "heeeello"));
        assert!(!glob_match("h*llo", "hell"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("h?llo", "hello"));
        assert!(glob_match("h?llo", "hallo"));
        assert!(!glob_match("h?llo", "hllo"));
    }

    #[test]
    fn test_char_set() {
        assert!(glob_match("h[ae]llo", "hello"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
    }

    #[test]
    fn test_many_stars_stay_cheap() {
        // A recursive matcher blows up on this shape; the iterative one
        // finishes immediately.
        let pattern = "a*".repeat(30) + "b";
        let text = "a".repeat(60);
        assert!(!glob_match(&pattern, &text));
        assert!(glob_match(&("a*".repeat(30) + "a"), &text));
    }

    #[test]
    fn test_multiple_stars_with_anchors() {
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(glob_match("*.tech.*", "news.tech.berlin"));
    }

    #[test]
    fn test_literal_only() {
        assert!(glob_match("news", "news"));
        assert!(!glob_match("news", "news.tech"));
    }
}
