//! # Cache Metrics
//!
//! Metric names emitted through the `metrics` facade, and the cache-tag
//! label attached to per-request metrics. Whoever installs a recorder (the
//! API binary installs the Prometheus exporter) decides where they go; with
//! no recorder installed every call is a no-op.
//!
//! Clients tag requests with the `X-Cache-Tags` header. Tags are
//! normalised into a single `cache_tags` label: empty tags dropped, `:`
//! replaced by `_`, remaining tags joined with `.`.

use std::fmt;

pub const SUMMARY_CALL_COUNT: &str = "artcache.summary.call.count";
pub const SUMMARY_ERROR_COUNT: &str = "artcache.summary.error.count";

pub const GET_CALL_COUNT: &str = "artcache.get.call.count";
pub const GET_ERROR_COUNT: &str = "artcache.get.error.count";
pub const GET_CALL_TIME: &str = "artcache.get.call.time";
pub const CACHE_HIT_COUNT: &str = "artcache.cache.hit.count";
pub const CACHE_MISS_COUNT: &str = "artcache.cache.miss.count";
pub const CONSISTENCY_VIOLATION_COUNT: &str = "artcache.consistency.violation.count";

pub const PUT_CALL_COUNT: &str = "artcache.put.call.count";
pub const PUT_ERROR_COUNT: &str = "artcache.put.error.count";
pub const PUT_REJECTED_COUNT: &str = "artcache.put.rejected.count";
pub const PUT_CALL_TIME: &str = "artcache.put.call.time";

pub const INCOMING_BYTES_TOTAL_COUNT: &str = "artcache.incoming.bytes.total";
pub const INCOMING_BYTES_PER_REQUEST: &str = "artcache.incoming.bytes.per.request";
pub const OUTGOING_BYTES_TOTAL_COUNT: &str = "artcache.outgoing.bytes.total";
pub const OUTGOING_BYTES_PER_REQUEST: &str = "artcache.outgoing.bytes.per.request";

pub const ADMISSION_WAIT_TIME: &str = "artcache.admission.wait.time";
pub const ADMISSION_REJECTED_COUNT: &str = "artcache.admission.rejected.count";

pub const RECLAMATION_EVENT_COUNT: &str = "artcache.reclamation.event.count";
pub const RECLAIMED_KEY_COUNT: &str = "artcache.reclamation.key.count";
pub const ORPHAN_RECLAIM_COUNT: &str = "artcache.orphan.reclaim.count";

/// Label name carrying normalised cache tags.
pub const CACHE_TAGS_LABEL: &str = "cache_tags";

/// Normalised client-supplied cache tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheTags(Option<String>);

impl CacheTags {
    /// No tags.
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse an `X-Cache-Tags` header value.
    ///
    /// The whole value is one tag, commas included; `:` becomes `_`.
    pub fn parse(header: Option<&str>) -> Self {
        Self(
            header
                .filter(|tag| !tag.is_empty())
                .map(|tag| tag.replace(':', "_")),
        )
    }

    /// The normalised tag, if any.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Whether no tags were supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The `cache_tags` label value; empty when untagged.
    pub fn label(&self) -> String {
        self.0.clone().unwrap_or_default()
    }
}

impl fmt::Display for CacheTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Increment a tagged counter.
pub(crate) fn count(name: &'static str, value: u64, tags: &CacheTags) {
    ::metrics::counter!(name, CACHE_TAGS_LABEL => tags.label()).increment(value);
}

/// Record a tagged histogram sample.
pub(crate) fn record(name: &'static str, value: f64, tags: &CacheTags) {
    ::metrics::histogram!(name, CACHE_TAGS_LABEL => tags.label()).record(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_missing_header_is_empty() {
        let tags = CacheTags::parse(None);
        assert!(tags.is_empty());
        assert_eq!(tags.label(), "");
    }

    #[test]
    fn parse_keeps_header_as_one_tag() {
        let tags = CacheTags::parse(Some("android:debug,ci"));
        assert_eq!(tags.as_str(), Some("android_debug,ci"));
        assert_eq!(tags.label(), "android_debug,ci");
        assert!(CacheTags::parse(Some("")).is_empty());
    }

    #[test]
    fn single_tag_round_trips() {
        assert_eq!(CacheTags::parse(Some("ios")).to_string(), "ios");
    }

    #[test]
    fn emitting_without_recorder_is_noop() {
        count(GET_CALL_COUNT, 1, &CacheTags::none());
        record(GET_CALL_TIME, 1.5, &CacheTags::parse(Some("x")));
    }
}
