use rustc_hash::{FxHashMap, FxHashSet};

use crate::util::{fnv1a_32, push_u32_hex_8, truncate_bytes};

/// Length of the `_xxxxxxxx` hash suffix appended to shortened names.
const HASH_SUFFIX_LEN: usize = 9;

/// Deterministic, reversible shortening of tool names for one request.
///
/// Names within `limit` pass through unchanged. Longer names become a prefix plus
/// a stable hash of the full name; a numeric suffix resolves the rare collision.
#[derive(Debug, Clone)]
pub struct ToolNameMap {
    limit: usize,
    to_upstream: FxHashMap<String, String>,
    to_original: FxHashMap<String, String>,
}

impl ToolNameMap {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            to_upstream: FxHashMap::default(),
            to_original: FxHashMap::default(),
        }
    }

    /// Build the mapping for every tool of a request.
    ///
    /// Names that already fit are registered first so a shortened name never
    /// takes a real tool's name.
    #[must_use]
    pub fn build<'a, I>(limit: usize, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut map = Self::new(limit);
        let (short, long): (Vec<&str>, Vec<&str>) =
            names.into_iter().partition(|name| name.len() <= limit);
        for name in short.into_iter().chain(long) {
            map.shorten(name);
        }
        map
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Register `name` and return its upstream form.
    pub fn shorten(&mut self, name: &str) -> String {
        if let Some(existing) = self.to_upstream.get(name) {
            return existing.clone();
        }
        let base = if name.len() <= self.limit {
            name.to_string()
        } else {
            hashed_name(name, self.limit)
        };
        let taken: FxHashSet<&str> = self.to_original.keys().map(String::as_str).collect();
        let mut candidate = base.clone();
        let mut n = 2usize;
        while taken.contains(candidate.as_str()) {
            let suffix = format!("_{n}");
            let keep = self.limit.saturating_sub(suffix.len()).min(base.len());
            candidate = format!("{}{suffix}", truncate_bytes(&base, keep));
            n += 1;
        }
        self.to_upstream
            .insert(name.to_string(), candidate.clone());
        self.to_original.insert(candidate.clone(), name.to_string());
        candidate
    }

    /// Upstream form of a registered name; unknown names pass through.
    #[must_use]
    pub fn upstream_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.to_upstream.get(name).map_or(name, String::as_str)
    }

    /// Original form of an upstream name; unknown names pass through.
    #[must_use]
    pub fn restore<'a>(&'a self, upstream: &'a str) -> &'a str {
        self.to_original.get(upstream).map_or(upstream, String::as_str)
    }

    /// `true` when no registered name needed shortening.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.to_upstream.iter().all(|(orig, up)| orig == up)
    }
}

fn hashed_name(name: &str, limit: usize) -> String {
    let prefix = truncate_bytes(name, limit.saturating_sub(HASH_SUFFIX_LEN));
    let mut out = String::with_capacity(limit);
    out.push_str(prefix);
    out.push('_');
    push_u32_hex_8(&mut out, fnv1a_32(name.as_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_name(tail: &str) -> String {
        format!("{}{tail}", "VeryLongToolName".repeat(5))
    }

    #[test]
    fn test_short_names_pass_through() {
        let mut map = ToolNameMap::new(64);
        assert_eq!(map.shorten("read_file"), "read_file");
        assert_eq!(map.restore("read_file"), "read_file");
        assert!(map.is_identity());
    }

    #[test]
    fn test_long_name_round_trip() {
        let name = long_name("_and_then_some");
        assert_eq!(name.len(), 94);
        let mut map = ToolNameMap::new(64);
        let short = map.shorten(&name);
        assert!(short.len() <= 64);
        assert_ne!(short, name);
        assert_eq!(map.restore(&short), name);
        assert_eq!(map.upstream_name(&name), short);
        assert!(!map.is_identity());
    }

    #[test]
    fn test_shortening_is_deterministic() {
        let name = long_name("_x");
        let a = ToolNameMap::build(64, [name.as_str()]);
        let b = ToolNameMap::build(64, [name.as_str()]);
        assert_eq!(a.upstream_name(&name), b.upstream_name(&name));
    }

    #[test]
    fn test_many_long_names_stay_distinct_within_limit() {
        let names: Vec<String> = (0..50).map(|i| long_name(&format!("_variant_{i}"))).collect();
        let map = ToolNameMap::build(64, names.iter().map(String::as_str));
        let mut seen = FxHashSet::default();
        for name in &names {
            let short = map.upstream_name(name);
            assert!(short.len() <= 64, "{short} exceeds limit");
            assert!(seen.insert(short.to_string()), "duplicate {short}");
            assert_eq!(map.restore(short), name.as_str());
        }
    }

    #[test]
    fn test_collision_gets_numeric_suffix_within_limit() {
        let name = long_name("_collide");
        let clash = hashed_name(&name, 64);
        let map = ToolNameMap::build(64, [name.as_str(), clash.as_str()]);
        assert_eq!(map.upstream_name(&clash), clash);
        let short = map.upstream_name(&name);
        assert_ne!(short, clash);
        assert!(short.ends_with("_2"));
        assert!(short.len() <= 64);
        assert_eq!(map.restore(short), name);
        assert_eq!(map.restore(&clash), clash);
    }

    #[test]
    fn test_unknown_names_pass_through() {
        let map = ToolNameMap::new(64);
        assert_eq!(map.restore("mystery"), "mystery");
        assert_eq!(map.upstream_name("mystery"), "mystery");
    }
}
