//! Topic name and topic filter rules.
//!
//! Filters support MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)

use crate::error::{Error, Result};

/// Check that `filter` is a valid subscription filter.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopicFilter("empty filter".to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(Error::InvalidTopicFilter(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(Error::InvalidTopicFilter(filter.to_string()));
        }
    }

    Ok(())
}

/// Check that `topic` can be published to.
pub fn validate_name(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(Error::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

/// Whether `topic` matches `filter`.
///
/// Topics starting with `$` are not matched by a filter whose first level
/// is a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
