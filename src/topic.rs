// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Topic filter matching.
//!
//! [`matches`] is the single definition of "filter matches topic". It is used
//! both for authorization (the session's rights pattern) and for delivery
//! (subscription filters). [`expand_filters`] enumerates every filter string a
//! concrete topic satisfies; it must agree with [`matches`] on every input and
//! is only an optimization for checking one topic against many stored filters.

use std::collections::HashSet;

/// Topics deeper than this are matched pairwise instead of by expansion,
/// since the expansion grows as `2^depth`.
pub const MAX_EXPANSION_DEPTH: usize = 10;

fn is_system_level(level: &str) -> bool {
    level.starts_with('$')
}

/// Returns true if `filter` matches the concrete `topic`.
///
/// - `+` matches exactly one level, any value.
/// - `#` matches the corresponding level and every following level, including
///   none at all (`a/#` matches `a`). It is only valid as the last level.
/// - Any other level must be equal.
/// - A topic whose first level starts with `$` is never matched by a filter
///   whose first level is a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    if is_system_level(topic_levels[0]) && matches!(filter_levels[0], "#" | "+") {
        return false;
    }

    for (i, topic_level) in topic_levels.iter().enumerate() {
        let Some(filter_level) = filter_levels.get(i) else {
            // topic is deeper than the filter
            return false;
        };
        match *filter_level {
            "#" => return i == filter_levels.len() - 1,
            "+" => {}
            literal if literal == *topic_level => {}
            _ => return false,
        }
    }

    let consumed = topic_levels.len();
    if filter_levels.len() == consumed {
        return true;
    }
    // make sport/tennis/# match sport/tennis
    filter_levels.len() == consumed + 1 && filter_levels[consumed] == "#"
}

/// Enumerates every filter string that matches `topic`.
///
/// That is every combination of replacing levels with `+`, every such
/// combination truncated and terminated by `#` (including the full-length one,
/// as `a/#` matches `a`), and the bare `#`. For `$`-topics the first level is
/// never replaced, and the bare `#` is omitted.
pub fn expand_filters(topic: &str) -> Vec<String> {
    let levels: Vec<&str> = topic.split('/').collect();
    let fixed_first = is_system_level(levels[0]);

    let mut filters = Vec::new();
    if !fixed_first {
        filters.push("#".to_string());
    }

    // prefixes of every length, each followed by "#"; the full length is the
    // exact (no "#") case as well
    let min_prefix = usize::from(fixed_first);
    for prefix_len in min_prefix..=levels.len() {
        for prefix in plus_combinations(&levels[..prefix_len], fixed_first) {
            if prefix_len == levels.len() {
                filters.push(prefix.clone());
            }
            if prefix_len > 0 {
                filters.push(format!("{prefix}/#"));
            }
        }
    }
    filters
}

/// All ways of replacing levels with `+`, joined with `/`.
fn plus_combinations(levels: &[&str], fixed_first: bool) -> Vec<String> {
    if levels.is_empty() {
        return vec![String::new()];
    }
    let free = if fixed_first { levels.len() - 1 } else { levels.len() };
    let offset = levels.len() - free;

    (0..1usize << free)
        .map(|mask| {
            levels
                .iter()
                .enumerate()
                .map(|(i, level)| {
                    if i >= offset && mask & (1 << (i - offset)) != 0 {
                        "+"
                    } else {
                        *level
                    }
                })
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect()
}

/// The set of filters a published topic satisfies, computed once and then
/// checked against every stored subscription filter.
#[derive(Debug)]
pub struct TopicMatches<'a> {
    topic: &'a str,
    expanded: Option<HashSet<String>>,
}

impl<'a> TopicMatches<'a> {
    pub fn new(topic: &'a str) -> Self {
        let depth = topic.split('/').count();
        let expanded = if depth <= MAX_EXPANSION_DEPTH {
            Some(expand_filters(topic).into_iter().collect())
        } else {
            None
        };
        Self { topic, expanded }
    }

    pub fn contains(&self, filter: &str) -> bool {
        match &self.expanded {
            Some(set) => set.contains(filter),
            None => matches(filter, self.topic),
        }
    }
}

/// Checks wildcard placement in a subscription filter.
///
/// `#` must be alone in the last level, `+` must be alone in its level and the
/// filter must not be empty.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return false;
        }
        if level.contains('+') && *level != "+" {
            return false;
        }
    }
    true
}

/// Checks a PUBLISH topic name: non-empty and free of wildcards.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(|c: char| c == '+' || c == '#')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_single_level() {
        assert!(matches("test", "test"));
        assert!(matches("one/two/three", "one/two/three"));
        assert!(matches("one/+/three", "one/two/three"));
        assert!(!matches("one/+/three", "bad/two/three"));
        assert!(!matches("one/bad/three", "one/two/three"));
        assert!(!matches("one", "two"));
        assert!(!matches("Test", "Test/Test"));
        assert!(!matches("TopicA/B", "TopicA"));
    }

    #[test]
    fn test_multi_level() {
        assert!(matches("one/#", "one/two/three"));
        assert!(matches("one/#", "one"));
        assert!(matches("#", "one/two/three"));
        assert!(!matches("one/#", "bad/two/three"));
        assert!(!matches("one/#/three", "one/two/three"));
        assert!(matches("+/#", "one"));
    }

    #[test]
    fn test_system_topics() {
        assert!(!matches("#", "$sys/foo"));
        assert!(!matches("+/foo", "$sys/foo"));
        assert!(!matches("#", "$/two/three"));
        assert!(matches("$sys/#", "$sys/foo"));
        assert!(matches("$sys/+", "$sys/foo"));
        assert!(matches("one/#", "one/$two/three"));
        assert!(matches("one/+/three", "one/$two/three"));
    }

    #[test]
    fn test_empty_filter() {
        assert!(matches("", ""));
        assert!(!matches("", "one/two/three"));
    }

    #[test]
    fn test_expand_counts() {
        // "+", "this", "#", "this/#", "+/#"
        assert_eq!(expand_filters("this").len(), 5);
        // 4 exact, 1 "#", 2 one-level "#", 4 two-level "#"
        assert_eq!(expand_filters("one/two").len(), 11);
        let sys = expand_filters("$sys/foo");
        assert!(!sys.contains(&"#".to_string()));
        assert!(sys.contains(&"$sys/+".to_string()));
        assert!(sys.contains(&"$sys/#".to_string()));
        assert!(!sys.contains(&"+/foo".to_string()));
    }

    fn candidate_filters() -> Vec<String> {
        let alphabet = ["a", "b", "$s", "+", "#", ""];
        let mut out = Vec::new();
        for x in alphabet {
            out.push(x.to_string());
            for y in alphabet {
                out.push(format!("{x}/{y}"));
                for z in alphabet {
                    out.push(format!("{x}/{y}/{z}"));
                }
            }
        }
        out.push("a+".to_string());
        out.push("a/b#".to_string());
        out
    }

    #[test]
    fn test_expansion_agrees_with_matches() {
        let topics = [
            "a", "b", "a/b", "a/a", "b/a/b", "$s", "$s/a", "$s/a/b", "a/$s", "", "a//b", "/a",
        ];
        let filters = candidate_filters();
        for topic in topics {
            let expanded: HashSet<String> = expand_filters(topic).into_iter().collect();
            for filter in &filters {
                assert_eq!(
                    matches(filter, topic),
                    expanded.contains(filter),
                    "filter '{filter}' topic '{topic}'"
                );
            }
            for filter in &expanded {
                assert!(matches(filter, topic), "expanded '{filter}' for '{topic}'");
            }
        }
    }

    #[test]
    fn test_topic_matches_falls_back_for_deep_topics() {
        let deep = (0..MAX_EXPANSION_DEPTH + 2)
            .map(|i| format!("l{i}"))
            .collect::<Vec<_>>()
            .join("/");
        let m = TopicMatches::new(&deep);
        assert!(m.expanded.is_none());
        assert!(m.contains("l0/#"));
        assert!(m.contains("#"));
        assert!(!m.contains("l1/#"));

        let shallow = TopicMatches::new("a/b");
        assert!(shallow.expanded.is_some());
        assert!(shallow.contains("a/+"));
        assert!(!shallow.contains("a"));
    }

    #[test]
    fn test_validation() {
        assert!(is_valid_filter("a/b"));
        assert!(is_valid_filter("a/+/c"));
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("a/#"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("a/#/c"));
        assert!(!is_valid_filter("a#"));
        assert!(!is_valid_filter("a/b+"));

        assert!(is_valid_topic_name("a/b"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("a/+"));
        assert!(!is_valid_topic_name("a/#"));
    }
}
