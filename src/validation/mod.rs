//! Request field validation.
//!
//! The validator consumes the endpoint's declared request fields and the
//! merged parameter map. Errors are collected per field and reported
//! together as a 400 response.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;

use crate::config::{RequestFieldConfig, ValidatorConfig, ValidatorRule};
use crate::errors::FieldError;

/// Validate the merged parameter map against the declared request fields.
/// Returns the collected errors; an empty list means the request passes.
pub fn validate_request_fields(
    fields: &[RequestFieldConfig],
    params: &BTreeMap<String, String>,
) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for field in fields {
        match params.get(&field.field_name) {
            None => {
                if field.required {
                    errors.push(FieldError::new(
                        &field.field_name,
                        "Missing required parameter",
                    ));
                }
            }
            Some(value) => {
                if field.required && value.is_empty() {
                    errors.push(FieldError::new(
                        &field.field_name,
                        "Required parameter must not be empty",
                    ));
                    continue;
                }
                for validator in &field.validators {
                    if let Some(message) = apply_validator(validator, value) {
                        errors.push(FieldError::new(&field.field_name, message));
                    }
                }
            }
        }
    }

    errors
}

/// Run one validator against a present value. Returns the error message
/// on rejection.
fn apply_validator(validator: &ValidatorConfig, value: &str) -> Option<String> {
    if validator.prevent_sql_injection {
        if let Some(message) = check_sql_injection(value) {
            return Some(message);
        }
    }

    match &validator.rule {
        ValidatorRule::Int { min, max } => {
            let parsed: i64 = match value.parse() {
                Ok(v) => v,
                Err(_) => return Some("Value is not a valid integer".to_string()),
            };
            if let Some(min) = min {
                if parsed < *min {
                    return Some("Integer value is less than the minimum allowed".to_string());
                }
            }
            if let Some(max) = max {
                if parsed > *max {
                    return Some("Integer value is greater than the maximum allowed".to_string());
                }
            }
            None
        }
        ValidatorRule::String { regex, min_length } => {
            if value.len() < *min_length {
                return Some("String is shorter than the minimum length".to_string());
            }
            if !regex.is_empty() {
                let anchored = format!("^(?:{regex})$");
                match Regex::new(&anchored) {
                    Ok(re) => {
                        if !re.is_match(value) {
                            return Some(
                                "String does not match the required pattern".to_string(),
                            );
                        }
                    }
                    Err(_) => {
                        return Some("Invalid validation pattern configured".to_string());
                    }
                }
            }
            None
        }
        ValidatorRule::Enum { allowed_values } => {
            if allowed_values.iter().any(|allowed| allowed == value) {
                None
            } else {
                Some("Value is not one of the allowed values".to_string())
            }
        }
        ValidatorRule::Date { min, max } => {
            let parsed = match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                Ok(d) => d,
                Err(_) => return Some("Value is not a valid ISO date".to_string()),
            };
            if let Some(min) = min.as_deref().and_then(parse_date) {
                if parsed < min {
                    return Some("Date is earlier than the minimum allowed".to_string());
                }
            }
            if let Some(max) = max.as_deref().and_then(parse_date) {
                if parsed > max {
                    return Some("Date is later than the maximum allowed".to_string());
                }
            }
            None
        }
        ValidatorRule::Time { min, max } => {
            let parsed = match NaiveTime::parse_from_str(value, "%H:%M:%S") {
                Ok(t) => t,
                Err(_) => return Some("Value is not a valid ISO time".to_string()),
            };
            if let Some(min) = min.as_deref().and_then(parse_time) {
                if parsed < min {
                    return Some("Time is earlier than the minimum allowed".to_string());
                }
            }
            if let Some(max) = max.as_deref().and_then(parse_time) {
                if parsed > max {
                    return Some("Time is later than the maximum allowed".to_string());
                }
            }
            None
        }
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    if value.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    if value.is_empty() {
        return None;
    }
    NaiveTime::parse_from_str(value, "%H:%M:%S").ok()
}

/// Reject values carrying unescaped quote, statement or comment tokens.
/// Doubled quotes count as escaped and are stripped before the check.
fn check_sql_injection(value: &str) -> Option<String> {
    let without_escapes = value.replace("''", "").replace("\"\"", "");
    const FORBIDDEN: &[&str] = &["'", "\"", ";", "--", "/*", "*/"];
    for token in FORBIDDEN {
        if without_escapes.contains(token) {
            return Some("Value contains potentially unsafe SQL characters".to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldIn;

    fn field(name: &str, required: bool, validators: Vec<ValidatorConfig>) -> RequestFieldConfig {
        RequestFieldConfig {
            field_name: name.to_string(),
            field_in: FieldIn::Query,
            description: String::new(),
            required,
            default_value: None,
            validators,
        }
    }

    fn int_validator(min: Option<i64>, max: Option<i64>) -> ValidatorConfig {
        ValidatorConfig {
            rule: ValidatorRule::Int { min, max },
            prevent_sql_injection: true,
        }
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_required_field() {
        let fields = vec![field("age", true, vec![])];
        let errors = validate_request_fields(&fields, &params(&[]));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "age");
        assert_eq!(errors[0].message, "Missing required parameter");
    }

    #[test]
    fn test_int_below_minimum() {
        let fields = vec![field("age", true, vec![int_validator(Some(1), Some(120))])];
        let errors = validate_request_fields(&fields, &params(&[("age", "0")]));
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Integer value is less than the minimum allowed"
        );
    }

    #[test]
    fn test_int_above_maximum_and_garbage() {
        let fields = vec![field("age", true, vec![int_validator(Some(1), Some(120))])];
        assert_eq!(
            validate_request_fields(&fields, &params(&[("age", "121")]))[0].message,
            "Integer value is greater than the maximum allowed"
        );
        assert_eq!(
            validate_request_fields(&fields, &params(&[("age", "abc")]))[0].message,
            "Value is not a valid integer"
        );
    }

    #[test]
    fn test_string_regex_whole_match() {
        let validator = ValidatorConfig {
            rule: ValidatorRule::String {
                regex: "[a-z]+".to_string(),
                min_length: 2,
            },
            prevent_sql_injection: true,
        };
        let fields = vec![field("name", true, vec![validator])];

        assert!(validate_request_fields(&fields, &params(&[("name", "alice")])).is_empty());
        assert_eq!(
            validate_request_fields(&fields, &params(&[("name", "alice7")]))[0].message,
            "String does not match the required pattern"
        );
        assert_eq!(
            validate_request_fields(&fields, &params(&[("name", "a")]))[0].message,
            "String is shorter than the minimum length"
        );
    }

    #[test]
    fn test_enum_is_case_sensitive() {
        let validator = ValidatorConfig {
            rule: ValidatorRule::Enum {
                allowed_values: vec!["asc".to_string(), "desc".to_string()],
            },
            prevent_sql_injection: true,
        };
        let fields = vec![field("order", false, vec![validator])];

        assert!(validate_request_fields(&fields, &params(&[("order", "asc")])).is_empty());
        assert_eq!(
            validate_request_fields(&fields, &params(&[("order", "ASC")])).len(),
            1
        );
    }

    #[test]
    fn test_date_bounds() {
        let validator = ValidatorConfig {
            rule: ValidatorRule::Date {
                min: Some("2020-01-01".to_string()),
                max: Some("2030-12-31".to_string()),
            },
            prevent_sql_injection: true,
        };
        let fields = vec![field("day", false, vec![validator])];

        assert!(validate_request_fields(&fields, &params(&[("day", "2026-08-01")])).is_empty());
        assert_eq!(
            validate_request_fields(&fields, &params(&[("day", "2019-01-01")]))[0].message,
            "Date is earlier than the minimum allowed"
        );
        assert_eq!(
            validate_request_fields(&fields, &params(&[("day", "not-a-date")]))[0].message,
            "Value is not a valid ISO date"
        );
    }

    #[test]
    fn test_time_bounds() {
        let validator = ValidatorConfig {
            rule: ValidatorRule::Time {
                min: Some("08:00:00".to_string()),
                max: Some("17:00:00".to_string()),
            },
            prevent_sql_injection: true,
        };
        let fields = vec![field("at", false, vec![validator])];

        assert!(validate_request_fields(&fields, &params(&[("at", "12:30:00")])).is_empty());
        assert_eq!(
            validate_request_fields(&fields, &params(&[("at", "18:00:00")]))[0].message,
            "Time is later than the maximum allowed"
        );
    }

    #[test]
    fn test_sql_injection_guard() {
        let fields = vec![field("q", false, vec![int_validator(None, None)])];
        for bad in ["1; DROP TABLE users", "1'--", "1/*x*/"] {
            assert!(
                !validate_request_fields(&fields, &params(&[("q", bad)])).is_empty(),
                "expected rejection for {bad}"
            );
        }

        // Escaped quotes pass the guard (and then fail the int parse).
        let errors = validate_request_fields(&fields, &params(&[("q", "it''s")]));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Value is not a valid integer");
    }

    #[test]
    fn test_errors_aggregate_across_fields() {
        let fields = vec![
            field("age", true, vec![int_validator(Some(1), None)]),
            field("name", true, vec![]),
        ];
        let errors = validate_request_fields(&fields, &params(&[("age", "0")]));
        assert_eq!(errors.len(), 2);
    }
}
