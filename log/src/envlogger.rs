//! `RUST_LOG`-style level filter for the synchronous drains.

use slog::{Drain, Level, OwnedKVList, Record};
use std::{env, str::FromStr};

#[derive(Debug, PartialEq)]
struct Filter {
    module: Option<String>,
    level: Level,
}

impl Filter {
    #[inline]
    fn matches_module(&self, module: &str) -> bool {
        self.module
            .as_ref()
            .map_or(true, |prefix| module.starts_with(prefix.as_str()))
    }

    /// Parse a single `module=level` or `level` directive.
    fn parse(directive: &str) -> Option<Self> {
        let mut kv = directive.trim().splitn(2, '=');
        let first = kv.next()?;
        match kv.next() {
            None => Level::from_str(first).ok().map(|level| Self {
                module: None,
                level,
            }),
            Some(level) => {
                let valid = !first.is_empty()
                    && first
                        .chars()
                        .all(|c| matches!(c, '0'..='9' | 'a'..='z' | 'A'..='Z' | ':' | '_'));
                if !valid {
                    return None;
                }
                Level::from_str(level).ok().map(|level| Self {
                    module: Some(first.to_string()),
                    level,
                })
            }
        }
    }
}

/// Parsed list of filter directives.
///
/// Invalid directives are ignored, the last matching directive wins.
struct Directives(Vec<Filter>);

impl Directives {
    #[inline]
    fn is_enabled(&self, module: &str, level: Level) -> bool {
        self.0
            .iter()
            .filter(|filter| filter.matches_module(module))
            .last()
            .map(|filter| level.is_at_least(filter.level))
            .unwrap_or_default()
    }
}

impl From<&str> for Directives {
    fn from(filter: &str) -> Self {
        Self(filter.split(',').filter_map(Filter::parse).collect())
    }
}

/// Drain wrapper that drops records rejected by the directives.
pub struct Logger<T: Drain> {
    drain: T,
    directives: Directives,
}

impl<T: Drain> Logger<T> {
    /// Use `RUST_LOG` if set, otherwise the supplied default filter.
    pub fn with_default_filter(drain: T, filter: &str) -> Self {
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| filter.to_string());

        Self {
            drain,
            directives: filter.as_str().into(),
        }
    }
}

impl<T> Drain for Logger<T>
where
    T: Drain<Ok = ()>,
{
    type Err = T::Err;
    type Ok = ();

    fn log(&self, info: &Record<'_>, val: &OwnedKVList) -> Result<(), T::Err> {
        if !self.directives.is_enabled(info.module(), info.level()) {
            return Ok(());
        }

        self.drain.log(info, val)
    }
}
