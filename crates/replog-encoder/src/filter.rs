//! Table include/exclude filter.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;

use replog_common::{ConfigError, ConfigResult, ReplicationConfig};

/// Number of table decisions remembered.
const DECISION_CACHE_SIZE: usize = 256;

/// Decides which tables are replicated.
///
/// Patterns must match the whole table name. A table is replicated if it
/// matches the include pattern (when there is one) and does not match the
/// exclude pattern (when there is one).
pub struct TableFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    decisions: Mutex<LruCache<String, bool>>,
}

impl TableFilter {
    /// Compiles the include and exclude patterns.
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> ConfigResult<Self> {
        Ok(Self {
            include: compile("include_filter", include)?,
            exclude: compile("exclude_filter", exclude)?,
            decisions: Mutex::new(LruCache::new(
                NonZeroUsize::new(DECISION_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    /// Builds the filter of a primary.
    pub fn from_config(config: &ReplicationConfig) -> ConfigResult<Self> {
        Self::new(
            config.include_filter.as_deref(),
            config.exclude_filter.as_deref(),
        )
    }

    /// A filter that replicates every table.
    pub fn allow_all() -> Self {
        Self {
            include: None,
            exclude: None,
            decisions: Mutex::new(LruCache::new(NonZeroUsize::MIN)),
        }
    }

    /// Returns true if changes to `table` are replicated.
    pub fn is_replicated(&self, table: &str) -> bool {
        if self.include.is_none() && self.exclude.is_none() {
            return true;
        }

        let mut decisions = self.decisions.lock();
        if let Some(&replicated) = decisions.get(table) {
            return replicated;
        }

        let included = self.include.as_ref().map_or(true, |re| re.is_match(table));
        let excluded = self.exclude.as_ref().map_or(false, |re| re.is_match(table));
        let replicated = included && !excluded;

        decisions.put(table.to_string(), replicated);
        replicated
    }
}

fn compile(option: &'static str, pattern: Option<&str>) -> ConfigResult<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(&format!("^(?:{})$", p))
                .map_err(|e| ConfigError::invalid(option, format!("bad pattern \"{}\": {}", p, e)))
        })
        .transpose()
}

impl std::fmt::Debug for TableFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFilter")
            .field("include", &self.include.as_ref().map(Regex::as_str))
            .field("exclude", &self.exclude.as_ref().map(Regex::as_str))
            .finish()
    }
}
