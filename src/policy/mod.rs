//! Route classification: resolve a request path to a numeric policy.
//!
//! A [`RouteTable`] is compiled from an ordered list of `(pattern, policy)`
//! pairs. Two pattern styles are supported:
//!
//! | Pattern                  | Example match                 |
//! |--------------------------|-------------------------------|
//! | `api/car-brands/popular` | exactly that path             |
//! | `api/car-brands/*`       | `api/car-brands/12/models`    |
//! | `api/parts/?`            | `api/parts/7`                 |
//!
//! `*` matches any run of characters, including `/`; `?` matches exactly one.
//! Leading and trailing slashes are ignored on both patterns and paths, so
//! `/api/parts/` and `api/parts` are the same route.
//!
//! Lookup tries every exact pattern before any glob; among globs the first one
//! declared wins.

use std::collections::HashMap;

use regex::Regex;

use crate::config::ConfigError;
use crate::http::request::normalize_route;

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    // Matches one exact path string, e.g. `api/car-brands`.
    Exact(String),
    // Shell-style glob compiled to an anchored regex.
    Glob { source: String, regex: Regex },
}

impl Pattern {
    /// Classify and compile a pattern string.
    ///
    /// Any pattern containing `*` or `?` is a glob; everything else is exact.
    fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let pattern = normalize_route(pattern);

        if !pattern.contains(['*', '?']) {
            return Ok(Pattern::Exact(pattern.to_owned()));
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;

        Ok(Pattern::Glob {
            source: pattern.to_owned(),
            regex,
        })
    }
}

/// An ordered exact/glob lookup table from route to policy value.
///
/// # Examples
///
/// ```
/// use gatehouse::policy::RouteTable;
///
/// let table = RouteTable::compile([
///     ("api/car-brands/*", 3_600u64),
///     ("api/car-brands/popular", 86_400),
/// ])
/// .unwrap();
///
/// // Exact entries win over globs regardless of declaration order.
/// assert_eq!(table.lookup("/api/car-brands/popular"), Some(86_400));
/// assert_eq!(table.lookup("api/car-brands/7"), Some(3_600));
/// assert_eq!(table.lookup("api/parts"), None);
/// ```
#[derive(Debug, Clone)]
pub struct RouteTable<P> {
    exact: HashMap<String, P>,
    globs: Vec<(String, Regex, P)>,
}

impl<P> Default for RouteTable<P> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            globs: Vec::new(),
        }
    }
}

impl<P: Copy> RouteTable<P> {
    /// Compiles `(pattern, policy)` pairs in declaration order.
    ///
    /// When the same exact pattern appears twice, the first declaration wins,
    /// mirroring glob precedence.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidPattern`] if a glob cannot be compiled.
    pub fn compile<I, S>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, P)>,
        S: AsRef<str>,
    {
        let mut table = Self::default();
        for (pattern, policy) in rules {
            match Pattern::parse(pattern.as_ref())? {
                Pattern::Exact(path) => {
                    table.exact.entry(path).or_insert(policy);
                }
                Pattern::Glob { source, regex } => table.globs.push((source, regex, policy)),
            }
        }
        Ok(table)
    }

    /// Resolves `path` to its policy: exact match, then first matching glob.
    pub fn lookup(&self, path: &str) -> Option<P> {
        let path = normalize_route(path);

        if let Some(policy) = self.exact.get(path) {
            return Some(*policy);
        }

        self.globs
            .iter()
            .find(|(_, regex, _)| regex.is_match(path))
            .map(|(_, _, policy)| *policy)
    }

    /// Like [`lookup`](Self::lookup), but also returns the pattern that matched.
    pub fn classify(&self, path: &str) -> Option<(&str, P)> {
        let path = normalize_route(path);

        if let Some((pattern, policy)) = self.exact.get_key_value(path) {
            return Some((pattern.as_str(), *policy));
        }

        self.globs
            .iter()
            .find(|(_, regex, _)| regex.is_match(path))
            .map(|(source, _, policy)| (source.as_str(), *policy))
    }

    /// Number of compiled patterns.
    pub fn len(&self) -> usize {
        self.exact.len() + self.globs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
