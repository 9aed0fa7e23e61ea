//! RFC3339Nano timestamp helpers (§6). All timestamps the core generates use
//! this format; timestamps accepted from callers must parse under RFC3339
//! with an optional nanosecond fraction.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::runtime::Runtime;

/// `2006-01-02T15:04:05.999999999Z07:00`, evaluated against `rt`'s
/// (possibly virtualized) wall clock.
pub fn now_rfc3339nano<RT: Runtime>(rt: &RT) -> String {
    let dt: DateTime<Utc> = rt.system_time().into();
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Empty string means "no bound" (§6: start/end may be omitted).
pub fn parse_optional_rfc3339(s: &str) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    if s.is_empty() {
        Ok(None)
    } else {
        parse_rfc3339(s).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_timestamps() {
        assert!(parse_optional_rfc3339("foobar").is_err());
    }

    #[test]
    fn empty_is_no_bound() {
        assert_eq!(parse_optional_rfc3339("").unwrap(), None);
    }

    #[test]
    fn accepts_second_precision_rfc3339() {
        assert!(parse_optional_rfc3339("2019-03-22T09:48:00Z").unwrap().is_some());
    }
}
