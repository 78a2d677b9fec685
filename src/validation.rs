//! Input validation utilities for config and identity files.

use std::time::Duration;

use crate::types::{Error, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that a value is positive.
pub fn validate_positive(n: f64, field: &str) -> Result<()> {
    if !n.is_finite() || n <= 0.0 {
        return Err(Error::validation(format!("{} must be positive", field)));
    }
    Ok(())
}

/// Validate that a duration is non-zero.
pub fn validate_non_zero_duration(d: Duration, field: &str) -> Result<()> {
    if d.is_zero() {
        return Err(Error::validation(format!("{} must be greater than zero", field)));
    }
    Ok(())
}

/// Validate an hour-of-day value (0..=23).
pub fn validate_hour(h: u32, field: &str) -> Result<()> {
    if h > 23 {
        return Err(Error::validation(format!(
            "{} must be between 0 and 23, got {}",
            field, h
        )));
    }
    Ok(())
}

/// Validate that a list has no duplicate entries.
pub fn validate_unique(items: &[String], field: &str) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for item in items {
        if !seen.insert(item.as_str()) {
            return Err(Error::validation(format!(
                "{} contains duplicate entry '{}'",
                field, item
            )));
        }
    }
    Ok(())
}
