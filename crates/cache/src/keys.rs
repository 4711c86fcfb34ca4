//! Cache key namespace.
//!
//! Every key is prefixed by the concern it caches, followed by the
//! root-anchored storage path (or search keyword) it was computed from:
//!
//! | key                            | kind       | payload                     |
//! |--------------------------------|------------|-----------------------------|
//! | `file:list:<path>`             | string     | JSON array of file entries  |
//! | `file:stats:<path>`            | string     | JSON file stats             |
//! | `file:search:<keyword>`        | string     | JSON array of file entries  |
//! | `file:search:history`          | sorted set | keywords scored by time     |
//! | `file:favorites`               | string     | JSON array of favorites     |
//! | `file:upload:progress:<path>`  | hash       | upload progress fields      |

use burrow_storage::StoragePath;
use std::time::Duration;

pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_STATS_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SEARCH_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_FAVORITES_TTL: Duration = Duration::from_secs(1800);
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(3600);
/// Number of distinct keywords kept in the search history.
pub const SEARCH_HISTORY_LIMIT: usize = 10;

const LISTING_PREFIX: &str = "file:list:";
const STATS_PREFIX: &str = "file:stats:";
const SEARCH_PREFIX: &str = "file:search:";
const PROGRESS_PREFIX: &str = "file:upload:progress:";

pub const SEARCH_HISTORY: &str = "file:search:history";
pub const FAVORITES: &str = "file:favorites";

pub fn listing(path: &StoragePath) -> String {
    format!("{LISTING_PREFIX}{path}")
}

pub fn stats(path: &StoragePath) -> String {
    format!("{STATS_PREFIX}{path}")
}

/// Key for cached search results, or `None` when the keyword would collide
/// with [`SEARCH_HISTORY`].
pub fn search(keyword: &str) -> Option<String> {
    let key = format!("{SEARCH_PREFIX}{keyword}");
    (key != SEARCH_HISTORY).then_some(key)
}

pub fn upload_progress(destination: &StoragePath) -> String {
    format!("{PROGRESS_PREFIX}{destination}")
}

/// GLOB pattern matching the listing key of every path strictly beneath
/// `path`.
pub fn listing_descendants(path: &StoragePath) -> String {
    descendants(LISTING_PREFIX, path)
}

/// GLOB pattern matching the stats key of every path strictly beneath `path`.
pub fn stats_descendants(path: &StoragePath) -> String {
    descendants(STATS_PREFIX, path)
}

fn descendants(prefix: &str, path: &StoragePath) -> String {
    match path.is_root() {
        true => format!("{}/*", escape_glob(prefix)),
        false => format!("{}{}/*", escape_glob(prefix), escape_glob(&path.to_string())),
    }
}

/// Escape SQLite `GLOB` metacharacters so that they match literally.
///
/// `GLOB` has no escape character; wrapping a metacharacter in a bracket
/// expression is the only way to match it. A lone `]` is already literal.
pub fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '*' | '?' | '[' => {
                escaped.push('[');
                escaped.push(c);
                escaped.push(']');
            },
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn p(path: &str) -> StoragePath {
        StoragePath::parse(path).unwrap()
    }

    #[test]
    fn test_keys_use_canonical_paths() {
        assert_eq!(listing(&p("a/./b/")), "file:list:/a/b");
        assert_eq!(stats(&StoragePath::root()), "file:stats:/");
        assert_eq!(upload_progress(&p("a/c.txt")), "file:upload:progress:/a/c.txt");
    }

    #[test]
    fn test_search_key_never_collides_with_history() {
        assert_eq!(search("report").as_deref(), Some("file:search:report"));
        assert_eq!(search("history"), None);
        assert_eq!(search("History").as_deref(), Some("file:search:History"));
    }

    #[rstest]
    #[case("plain", "plain")]
    #[case("a*b", "a[*]b")]
    #[case("what?", "what[?]")]
    #[case("[draft]", "[[]draft]")]
    fn test_escape_glob(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(escape_glob(raw), expected);
    }

    #[test]
    fn test_descendant_patterns() {
        assert_eq!(listing_descendants(&p("a")), "file:list:/a/*");
        assert_eq!(stats_descendants(&p("x*")), "file:stats:/x[*]/*");
        assert_eq!(listing_descendants(&StoragePath::root()), "file:list:/*");
    }
}
