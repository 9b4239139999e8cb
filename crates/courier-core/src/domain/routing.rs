//! Topic routing keys and binding patterns.
//!
//! Routing keys are dot-separated words (`region.created`). Binding patterns
//! follow topic-exchange semantics:
//! - `*` matches exactly one word
//! - `#` matches zero or more words

use std::fmt;

/// A binding pattern such as `region.*` or `audit.#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPattern {
    pattern: String,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// True when the pattern contains no wildcard words.
    pub fn is_exact(&self) -> bool {
        !self.pattern.split('.').any(|w| w == "*" || w == "#")
    }

    /// Number of wildcard words; lower is more specific.
    pub fn wildcard_count(&self) -> usize {
        self.pattern
            .split('.')
            .filter(|w| *w == "*" || *w == "#")
            .count()
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let pattern: Vec<&str> = self.pattern.split('.').collect();
        let key: Vec<&str> = routing_key.split('.').collect();
        match_words(&pattern, &key)
    }
}

/// `reachable[j]`: the pattern words consumed so far can match `key[..j]`.
/// One pass per pattern word, so cost is O(pattern * key) however many `#`
/// the pattern has.
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for (i, word) in pattern.iter().enumerate() {
        // 連続する `#` は 1 つと同じ
        if *word == "#" && i > 0 && pattern[i - 1] == "#" {
            continue;
        }
        let mut next = vec![false; key.len() + 1];
        match *word {
            "#" => {
                // `#` は 0 語以上を吸収する
                let mut seen = false;
                for j in 0..=key.len() {
                    seen |= reachable[j];
                    next[j] = seen;
                }
            }
            "*" => {
                for j in 0..key.len() {
                    next[j + 1] = reachable[j];
                }
            }
            literal => {
                for j in 0..key.len() {
                    next[j + 1] = reachable[j] && key[j] == literal;
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }
    reachable[key.len()]
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl From<&str> for TopicPattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TopicPattern {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("region.created", "region.created", true)]
    #[case("region.created", "region.updated", false)]
    #[case("region.*", "region.created", true)]
    #[case("region.*", "region", false)]
    #[case("region.*", "region.created.v2", false)]
    #[case("*.created", "city.created", true)]
    #[case("#", "anything.at.all", true)]
    #[case("#", "", true)]
    #[case("audit.#", "audit", true)]
    #[case("audit.#", "audit.user.login", true)]
    #[case("audit.#.failed", "audit.failed", true)]
    #[case("audit.#.failed", "audit.user.login.failed", true)]
    #[case("audit.#.failed", "audit.user.login", false)]
    #[case("*.*", "city.updated", true)]
    #[case("#.#", "a.b", true)]
    #[case("a.#.#.b", "a.b", true)]
    #[case("#.*", "", true)]
    #[case("#.*.#", "a.b.c", true)]
    #[case("*.#.*", "a", false)]
    fn topic_matching(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(TopicPattern::new(pattern).matches(key), expected);
    }

    #[test]
    fn many_hash_words_do_not_blow_up() {
        let pattern = TopicPattern::new(vec!["#"; 24].join(".") + ".z.#.#.y");
        let key = vec!["w"; 64].join(".");
        assert!(!pattern.matches(&key));
        assert!(pattern.matches(&format!("{key}.z.y")));
    }

    #[test]
    fn exactness_and_specificity() {
        assert!(TopicPattern::new("region.created").is_exact());
        assert!(!TopicPattern::new("region.*").is_exact());
        assert_eq!(TopicPattern::new("#.*").wildcard_count(), 2);
    }
}
