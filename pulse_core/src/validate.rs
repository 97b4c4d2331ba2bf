//! Name validation matching the text exposition format rules:
//! metric names `[a-zA-Z_:][a-zA-Z0-9_:]*`, label names `[a-zA-Z_][a-zA-Z0-9_]*`.

use crate::error::{MetricError, Result};

pub fn metric_name(name: &str) -> Result<()> {
    if valid(name, true) {
        Ok(())
    } else {
        Err(MetricError::InvalidMetricName(name.to_string()))
    }
}

pub fn label_name(name: &str) -> Result<()> {
    if valid(name, false) {
        Ok(())
    } else {
        Err(MetricError::InvalidLabelName(name.to_string()))
    }
}

pub fn is_valid_metric_name(name: &str) -> bool {
    valid(name, true)
}

pub fn is_valid_label_name(name: &str) -> bool {
    valid(name, false)
}

fn valid(name: &str, allow_colon: bool) -> bool {
    let mut chars = name.chars();
    let first_ok = match chars.next() {
        Some(c) => c.is_ascii_alphabetic() || c == '_' || (allow_colon && c == ':'),
        None => return false,
    };
    first_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names() {
        assert!(is_valid_metric_name("requests_total"));
        assert!(is_valid_metric_name("_private"));
        assert!(is_valid_metric_name("ns:subsystem:name"));
        assert!(!is_valid_metric_name(""));
        assert!(!is_valid_metric_name("9requests"));
        assert!(!is_valid_metric_name("requests-total"));
        assert!(!is_valid_metric_name("naïve"));
    }

    #[test]
    fn label_names() {
        assert!(is_valid_label_name("method"));
        assert!(is_valid_label_name("_hidden"));
        assert!(!is_valid_label_name(""));
        assert!(!is_valid_label_name("le:gacy"));
        assert!(!is_valid_label_name("0code"));
    }

    #[test]
    fn errors_carry_the_offending_name() {
        let err = metric_name("bad-name").unwrap_err();
        assert!(err.to_string().contains("bad-name"));
        assert!(label_name("bad-label").is_err());
    }
}
