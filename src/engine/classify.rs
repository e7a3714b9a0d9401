//! Single classification table mapping raw engine log lines to events
//! (spec.md §4.5, §9: "concentrate it in one small table").

use std::sync::LazyLock;

use regex::Regex;

/// One classified event per consumed log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A file finished transferring.
    FileComplete {
        /// Remote-relative path of the completed file.
        path: String,
        /// Size in bytes, if the line carried one.
        size: Option<u64>,
    },
    /// A rate-limit signal was seen; the credential should be banned.
    RateLimit {
        /// The matched rate-limit class, used to look up a delay in
        /// `rate_limits` config.
        kind: String,
    },
    /// The engine has stopped starting new transfers but may still be
    /// scanning remaining candidates (spec.md §4.5 early-termination
    /// candidacy).
    MaxTransferReached,
    /// An unrecoverable engine message; abort the stage.
    Fatal {
        /// The raw line that triggered the fatal classification.
        message: String,
    },
    /// Anything not recognized by the table (spec.md §4.5, §7:
    /// classification failures default to "ignore").
    Ignore,
}

struct PatternEntry {
    regex: &'static LazyLock<Regex>,
    build: fn(&regex::Captures) -> EngineEvent,
}

static FILE_COMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)^(?:Copied|Moved)\s*\(\S+\)\s+(?P<path>\S+)(?:\s+\((?P<size>[0-9]+) bytes?\))?")
        .unwrap()
});

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)(userRateLimitExceeded|dailyLimitExceeded|403: User rate limit|403 Forbidden.*rate limit)")
        .unwrap()
});

static MAX_TRANSFER_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)max transfer limit reached").unwrap()
});

static FATAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)(Fatal error|couldn't connect:.*no such host|invalid_grant|failed to configure.*remote)")
        .unwrap()
});

fn build_file_complete(captures: &regex::Captures) -> EngineEvent {
    EngineEvent::FileComplete {
        path: captures.name("path").map_or_else(String::new, |m| m.as_str().to_string()),
        size: captures
            .name("size")
            .and_then(|m| m.as_str().parse::<u64>().ok()),
    }
}

fn build_rate_limit(captures: &regex::Captures) -> EngineEvent {
    EngineEvent::RateLimit {
        kind: captures
            .get(1)
            .map_or_else(|| "unknown".to_string(), |m| m.as_str().to_string()),
    }
}

fn build_max_transfer(_captures: &regex::Captures) -> EngineEvent {
    EngineEvent::MaxTransferReached
}

fn build_fatal(captures: &regex::Captures) -> EngineEvent {
    EngineEvent::Fatal {
        message: captures.get(0).map_or_else(String::new, |m| m.as_str().to_string()),
    }
}

static TABLE: LazyLock<[PatternEntry; 4]> = LazyLock::new(|| {
    [
        PatternEntry { regex: &FILE_COMPLETE_RE, build: build_file_complete },
        PatternEntry { regex: &RATE_LIMIT_RE, build: build_rate_limit },
        PatternEntry { regex: &MAX_TRANSFER_RE, build: build_max_transfer },
        PatternEntry { regex: &FATAL_RE, build: build_fatal },
    ]
});

/// Classifies one raw log line into exactly one [`EngineEvent`].
///
/// Table order matters: rate-limit and fatal patterns are checked
/// before the generic file-complete pattern would otherwise be (they
/// do not overlap in practice, but evaluation order is fixed here so a
/// future ambiguous pattern has documented precedence).
#[must_use]
pub fn classify_line(line: &str) -> EngineEvent {
    for entry in TABLE.iter() {
        if let Some(captures) = entry.regex.captures(line) {
            return (entry.build)(&captures);
        }
    }
    EngineEvent::Ignore
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_file_complete_with_size() {
        let event = classify_line("Copied (new) some/path/file.bin (104857600 bytes)");
        assert_eq!(
            event,
            EngineEvent::FileComplete {
                path: "some/path/file.bin".to_string(),
                size: Some(104_857_600),
            }
        );
    }

    #[test]
    fn test_classify_file_complete_without_size() {
        let event = classify_line("Moved (server side) some/path/file.bin");
        match event {
            EngineEvent::FileComplete { path, size } => {
                assert_eq!(path, "some/path/file.bin");
                assert!(size.is_none());
            }
            other => panic!("expected FileComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_rate_limit() {
        let event = classify_line("Failed to copy: googleapi: Error 403: userRateLimitExceeded");
        assert!(matches!(event, EngineEvent::RateLimit { .. }));
    }

    #[test]
    fn test_classify_daily_limit() {
        let event = classify_line("googleapi: Error 403: dailyLimitExceeded");
        assert!(matches!(event, EngineEvent::RateLimit { .. }));
    }

    #[test]
    fn test_classify_max_transfer_reached() {
        let event = classify_line("NOTICE: Max transfer limit reached as set by --max-transfer");
        assert_eq!(event, EngineEvent::MaxTransferReached);
    }

    #[test]
    fn test_classify_fatal() {
        let event = classify_line("Fatal error: couldn't initialize remote");
        assert!(matches!(event, EngineEvent::Fatal { .. }));
    }

    #[test]
    fn test_classify_unrecognized_is_ignored() {
        let event = classify_line("INFO: Transferred: 0 / 100, 0%");
        assert_eq!(event, EngineEvent::Ignore);
    }
}
