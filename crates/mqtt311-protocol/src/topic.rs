//! Topic name/filter validation and wildcard matching.

use crate::encoding::MAX_STRING_LENGTH;

/// Whether `topic` is a valid topic name for publishing: non-empty, free
/// of wildcard characters and the null character, and encodable in a
/// two-byte length prefix.
#[must_use]
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_STRING_LENGTH
        && !topic.contains('+')
        && !topic.contains('#')
        && !topic.contains('\0')
}

/// Whether `filter` is a valid subscription filter: `+` must occupy a
/// whole level, `#` must occupy the whole final level.
#[must_use]
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAX_STRING_LENGTH || filter.contains('\0') {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return false;
        }
        if level.contains('+') && *level != "+" {
            return false;
        }
    }
    true
}

/// MQTT topic matching: `+` matches exactly one level, `#` (final level
/// only) matches zero or more trailing levels. A `$`-prefixed first level
/// (`$SYS`, …) is never matched by a wildcard in the first position.
#[must_use]
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(pattern), Some(level)) if pattern == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
