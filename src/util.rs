//! Utility functions used by the load test.

use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;
use std::time;
use url::Url;

use crate::{LoadTestError, CANCELED};

lazy_static! {
    static ref TIMESPAN: Regex = Regex::new(
        r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?((?P<millis>\d+)ms)?$"
    )
    .expect("failed to compile timespan regex");
}

/// Parse a string representing a time span.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", "s" and "ms", in that order, indicating
/// "hours", "minutes", "seconds" and "milliseconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 500ms, 1s500ms, etc.
/// Anything else returns `None`.
///
/// # Example
/// ```rust
/// use flash_sale_loadtest::util;
/// use std::time::Duration;
///
/// // 1 hour 2 minutes and 3 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // Half a second.
/// assert_eq!(util::parse_timespan("500ms"), Some(Duration::from_millis(500)));
///
/// // Unknown units are rejected.
/// assert_eq!(util::parse_timespan("foo"), None);
/// assert_eq!(util::parse_timespan("2d"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<time::Duration> {
    // If an integer is passed in, assume it's seconds.
    if let Ok(t) = u64::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, t);
        return Some(time::Duration::from_secs(t));
    }

    // Otherwise use a regex to extract hours, minutes, seconds and milliseconds.
    let time_matches = TIMESPAN.captures(time_str)?;
    if time_str.is_empty() {
        return None;
    }
    let component = |name: &str| -> Option<u64> {
        match time_matches.name(name) {
            Some(m) => u64::from_str(m.as_str()).ok(),
            None => Some(0),
        }
    };
    let hours = component("hours")?;
    let minutes = component("minutes")?;
    let seconds = component("seconds")?;
    let millis = component("millis")?;
    let total = hours
        .checked_mul(60 * 60)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?;
    trace!(
        "{} hours {} minutes {} seconds {} milliseconds",
        hours,
        minutes,
        seconds,
        millis
    );
    time::Duration::from_secs(total).checked_add(time::Duration::from_millis(millis))
}

/// Truncate strings when they're too long to display.
///
/// If a string is longer than the specified max length, this function removes extra
/// the characters and replaces the last two with a double-period ellipsis.
///
/// # Example
/// ```rust
/// use flash_sale_loadtest::util;
///
/// assert_eq!(util::truncate_string("POST /api/v1/flash-sale/purchase", 16), "POST /api/v1/f..");
/// assert_eq!(util::truncate_string("GET items", 15), "GET items");
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length - 2) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Convert optional string to f32, otherwise return None.
///
/// # Example
/// ```rust
/// use flash_sale_loadtest::util;
///
/// assert_eq!(util::get_float_from_string(Some("1.5".to_string())), Some(1.5));
/// assert_eq!(util::get_float_from_string(Some("1.1.1".to_string())), None);
/// assert_eq!(util::get_float_from_string(None), None);
/// ```
pub fn get_float_from_string(string: Option<String>) -> Option<f32> {
    match string {
        Some(s) => match s.parse::<f32>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("failed to convert {} to float: {}", s, e);
                None
            }
        },
        None => None,
    }
}

/// Helper function to determine if a base url can be parsed.
///
/// # Example
/// ```rust
/// use flash_sale_loadtest::util;
///
/// assert!(util::is_valid_host("http://localhost:8080").is_ok());
/// // Protocol is required.
/// assert!(util::is_valid_host("localhost/").is_err());
/// ```
pub fn is_valid_host(host: &str) -> Result<bool, LoadTestError> {
    Url::parse(host).map_err(|parse_error| LoadTestError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid base url.".to_string(),
        parse_error,
    })?;
    Ok(true)
}

/// Join a path onto the configured base url, tolerating a trailing slash (or lack
/// of one) on the base.
///
/// # Example
/// ```rust
/// use flash_sale_loadtest::util;
///
/// assert_eq!(
///     util::build_url("http://localhost:8080/", "/api/v1/flash-sale/items"),
///     "http://localhost:8080/api/v1/flash-sale/items"
/// );
/// ```
pub fn build_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// Internal helper to configure the control-c handler. Shutdown cleanly on the first
// ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler() {
    match ctrlc::set_handler(move || {
        // We've caught a ctrl-c, determine if it's the first time or an additional time.
        if *CANCELED.read().unwrap_or_else(|e| e.into_inner()) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            let mut canceled = CANCELED.write().unwrap_or_else(|e| e.into_inner());
            *canceled = true;
        }
    }) {
        Ok(_) => (),
        Err(e) => {
            // When running in tests, reset CANCELED with each new test allowing testing
            // of the ctrl-c handler.
            let mut canceled = CANCELED.write().unwrap_or_else(|e| e.into_inner());
            *canceled = false;
            info!("reset ctrl-c handler: {}", e);
        }
    }
}

/// Returns `true` once ctrl-c has been caught.
pub(crate) fn canceled() -> bool {
    *CANCELED.read().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timespan() {
        let secs = time::Duration::from_secs;
        assert_eq!(parse_timespan("0"), Some(secs(0)));
        assert_eq!(parse_timespan("1"), Some(secs(1)));
        assert_eq!(parse_timespan("1s"), Some(secs(1)));
        assert_eq!(parse_timespan("30s"), Some(secs(30)));
        assert_eq!(parse_timespan("1m"), Some(secs(60)));
        assert_eq!(parse_timespan("1m1s"), Some(secs(61)));
        assert_eq!(parse_timespan("1m30s"), Some(secs(90)));
        assert_eq!(parse_timespan("10m5s"), Some(secs(605)));
        assert_eq!(parse_timespan("1h"), Some(secs(3600)));
        assert_eq!(parse_timespan("1h5m13s"), Some(secs(3913)));
        assert_eq!(parse_timespan("24h"), Some(secs(86400)));

        // Milliseconds are not minutes.
        assert_eq!(parse_timespan("500ms"), Some(time::Duration::from_millis(500)));
        assert_eq!(
            parse_timespan("1m30s250ms"),
            Some(time::Duration::from_millis(90_250))
        );

        // Anything else is rejected rather than reinterpreted.
        assert_eq!(parse_timespan(""), None);
        assert_eq!(parse_timespan("foo"), None);
        assert_eq!(parse_timespan("soon"), None);
        assert_eq!(parse_timespan("2d"), None);
        assert_eq!(parse_timespan("1.5s"), None);
        assert_eq!(parse_timespan("30s10m"), None);
        assert_eq!(parse_timespan("10 m"), None);
    }

    #[test]
    fn truncate() {
        assert_eq!(
            truncate_string("the quick brown fox", 25),
            "the quick brown fox"
        );
        assert_eq!(truncate_string("the quick brown fox", 10), "the quic..");
        assert_eq!(truncate_string("abcde", 5), "abcde");
        assert_eq!(truncate_string("abcde", 4), "ab..");
        assert_eq!(truncate_string("これはテストだ", 3), "こ..");
    }

    #[test]
    fn valid_host() {
        assert!(is_valid_host("http://localhost:8080").is_ok());
        assert!(is_valid_host("https://shop.example.com/").is_ok());
        assert!(is_valid_host("localhost/").is_err());
        assert!(is_valid_host("/api/v1").is_err());
        assert!(is_valid_host("http://").is_err());
    }

    #[test]
    fn join_url() {
        assert_eq!(
            build_url("http://localhost:8080", "/api/v1/auth/login"),
            "http://localhost:8080/api/v1/auth/login"
        );
        assert_eq!(
            build_url("http://localhost:8080/", "api/v1/auth/login"),
            "http://localhost:8080/api/v1/auth/login"
        );
    }
}
