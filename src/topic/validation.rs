//! Topic name and filter validation, and the topic/filter matcher
//!
//! Rules:
//! - Topic names must not contain wildcards (+ or #)
//! - Multi-level wildcard (#) must occupy an entire level and be last
//! - Single-level wildcard (+) must occupy an entire level and matches
//!   exactly one non-empty level
//! - Topics starting with $ are matched like any other topic

/// Validate a topic name (used in PUBLISH and as a will topic)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err("topic name must not contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy an entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be the final level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy an entire level");
        }
    }

    Ok(())
}

fn check_common(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic must not be empty");
    }
    if topic.len() > 65535 {
        return Err("topic exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic must not contain a null character");
    }
    Ok(())
}

/// Check whether a concrete topic name matches a topic filter.
///
/// Pure and deterministic: `/` separates levels, `+` matches exactly one
/// non-empty level, `#` matches all remaining levels including none.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        let filter_level = match filter_levels.next() {
            Some(l) => l,
            // Filter exhausted: match iff the topic is too
            None => return topic_levels.next().is_none(),
        };

        // "#" matches all remaining levels, including none, so
        // "sport/#" matches "sport" itself
        if filter_level == "#" {
            return true;
        }

        let topic_level = match topic_levels.next() {
            Some(l) => l,
            None => return false,
        };

        if filter_level == "+" {
            if topic_level.is_empty() {
                return false;
            }
        } else if filter_level != topic_level {
            return false;
        }
    }
}
