//! Caller input checks run before any provider request
//!
//! Failures are `Validation` records carrying `field`, `expected` and
//! `actual` context, and never enter the retry path.

use chrono::NaiveDate;

use crate::error::ErrorRecord;

/// Longest variable code accepted by either provider
pub const MAX_VARIABLE_CODE_LEN: usize = 50;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Earliest date either provider serves
pub const EARLIEST_DATE: (i32, u32, u32) = (1900, 1, 1);

/// Latest date accepted, including forecast horizons
pub const LATEST_DATE: (i32, u32, u32) = (2030, 12, 31);

fn validation_error(field: &str, expected: &str, actual: &str, message: String) -> ErrorRecord {
    ErrorRecord::validation(message)
        .with_context("field", field)
        .with_context("expected", expected)
        .with_context("actual", actual)
}

/// Normalize variable codes: trimmed and upper-cased
///
/// ```rust
/// use fedetl::validation::validate_variable_codes;
///
/// let codes = validate_variable_codes(&[" gdp", "FedFunds "]).unwrap();
/// assert_eq!(codes, vec!["GDP", "FEDFUNDS"]);
/// ```
pub fn validate_variable_codes<S: AsRef<str>>(codes: &[S]) -> Result<Vec<String>, ErrorRecord> {
    if codes.is_empty() {
        return Err(validation_error(
            "variables",
            "at least one variable code",
            "empty list",
            "No variable codes provided".to_string(),
        ));
    }

    codes
        .iter()
        .enumerate()
        .map(|(index, code)| {
            let field = format!("variables[{}]", index);
            let normalized = code.as_ref().trim().to_uppercase();
            if normalized.is_empty() {
                return Err(validation_error(
                    &field,
                    "a non-empty variable code",
                    code.as_ref(),
                    "Variable code cannot be empty".to_string(),
                ));
            }
            if normalized.chars().count() > MAX_VARIABLE_CODE_LEN {
                return Err(validation_error(
                    &field,
                    "at most 50 characters",
                    &normalized,
                    format!(
                        "Variable code is too long ({} characters)",
                        normalized.chars().count()
                    ),
                ));
            }
            Ok(normalized)
        })
        .collect()
}

fn bound(date: (i32, u32, u32)) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(date.0, date.1, date.2)
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ErrorRecord> {
    let date = NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| {
        validation_error(
            field,
            "YYYY-MM-DD",
            value,
            format!("Invalid date format for {}: {}", field, value),
        )
    })?;

    let (Some(earliest), Some(latest)) = (bound(EARLIEST_DATE), bound(LATEST_DATE)) else {
        return Ok(date);
    };
    if date < earliest || date > latest {
        return Err(validation_error(
            field,
            "a date between 1900-01-01 and 2030-12-31",
            value,
            format!("{} is outside the supported range: {}", field, value),
        ));
    }
    Ok(date)
}

/// Parse and check a `YYYY-MM-DD` date range; `start` must precede `end`
///
/// ```rust
/// use fedetl::validation::validate_date_range;
///
/// let (start, end) = validate_date_range("2020-01-01", "2020-12-31").unwrap();
/// assert!(start < end);
/// assert!(validate_date_range("2021-01-01", "2020-01-01").is_err());
/// ```
pub fn validate_date_range(start: &str, end: &str) -> Result<(NaiveDate, NaiveDate), ErrorRecord> {
    let start_date = parse_date("start_date", start)?;
    let end_date = parse_date("end_date", end)?;

    if start_date >= end_date {
        return Err(validation_error(
            "date_range",
            "start_date before end_date",
            &format!("{} to {}", start, end),
            format!("Start date {} must be before end date {}", start, end),
        )
        .with_code("INVALID_DATE_RANGE"));
    }
    Ok((start_date, end_date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::Value;

    #[test]
    fn test_variable_codes_are_normalized() {
        let codes = validate_variable_codes(&["gdp", " unrate ", "Fedfunds"]).unwrap();
        assert_eq!(codes, vec!["GDP", "UNRATE", "FEDFUNDS"]);
    }

    #[test]
    fn test_empty_and_blank_codes_rejected() {
        let empty: [&str; 0] = [];
        let err = validate_variable_codes(&empty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = validate_variable_codes(&["GDP", "   "]).unwrap_err();
        assert_eq!(err.context().get("field"), Some(&Value::from("variables[1]")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_long_code_rejected() {
        let long = "X".repeat(51);
        assert!(validate_variable_codes(&[long.as_str()]).is_err());
        let exact = "X".repeat(50);
        assert!(validate_variable_codes(&[exact.as_str()]).is_ok());
    }

    #[test]
    fn test_date_range() {
        let (start, end) = validate_date_range("2000-01-01", "2000-01-02").unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2000, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2000, 1, 2).unwrap());
    }

    #[test]
    fn test_date_range_rejections() {
        let err = validate_date_range("2020-13-01", "2021-01-01").unwrap_err();
        assert_eq!(err.context().get("field"), Some(&Value::from("start_date")));
        assert_eq!(err.context().get("expected"), Some(&Value::from("YYYY-MM-DD")));

        let err = validate_date_range("2020-01-01", "2020-01-01").unwrap_err();
        assert_eq!(err.error_code(), Some("INVALID_DATE_RANGE"));

        assert!(validate_date_range("1899-12-31", "1950-01-01").is_err());
        assert!(validate_date_range("2000-01-01", "2031-01-01").is_err());
        assert!(validate_date_range("01/01/2020", "2021-01-01").is_err());
    }
}
