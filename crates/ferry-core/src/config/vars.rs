//! Environment variable interpolation for config files.
//!
//! Supported syntax:
//! - `$VAR` or `${VAR}` - substitute with the variable, error if unset
//! - `${VAR:-default}` - use default if VAR is unset or empty
//! - `${VAR-default}` - use default only if VAR is unset
//! - `$$` - literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # escaped dollar
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)   # 1: braced name
            (?:(:?-)([^}]*))?          # 2: default operator, 3: default value
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)     # 4: bare name
        ",
    )
    .expect("Invalid regex pattern")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// Every problem found; all are collected so users see them at once.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| substitute(caps, &mut errors))
        .into_owned();

    InterpolationResult { text, errors }
}

fn substitute(caps: &Captures, errors: &mut Vec<String>) -> String {
    let whole = &caps[0];
    if whole == "$$" {
        return "$".to_string();
    }

    let Some(name) = caps.get(1).or_else(|| caps.get(4)).map(|m| m.as_str()) else {
        return whole.to_string();
    };
    let operator = caps.get(2).map(|m| m.as_str());
    let default = caps.get(3).map(|m| m.as_str());

    match env::var(name) {
        Ok(value) if value.contains('\n') || value.contains('\r') => {
            errors.push(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
            whole.to_string()
        }
        Ok(value) if value.is_empty() && operator == Some(":-") => {
            default.unwrap_or_default().to_string()
        }
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                errors.push(format!("environment variable '{name}' is not set"));
                whole.to_string()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        // SAFETY: every test uses its own variable names and restores them afterwards
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        let result = f();

        // SAFETY: restoring the state captured above
        for (key, original) in originals {
            match original {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_bare_and_braced_substitution() {
        with_env_vars(&[("FERRY_TEST_TEMP", Some("/scratch"))], || {
            let result = interpolate("a: $FERRY_TEST_TEMP\nb: ${FERRY_TEST_TEMP}/sinks");
            assert!(result.is_ok());
            assert_eq!(result.text, "a: /scratch\nb: /scratch/sinks");
        });
    }

    #[test]
    fn test_missing_variable_error() {
        with_env_vars(&[("FERRY_TEST_MISSING", None)], || {
            let result = interpolate("value: $FERRY_TEST_MISSING");
            assert!(!result.is_ok());
            assert_eq!(result.errors.len(), 1);
            assert!(result.errors[0].contains("FERRY_TEST_MISSING"));
            assert!(result.errors[0].contains("not set"));
        });
    }

    #[test]
    fn test_default_operators() {
        with_env_vars(
            &[
                ("FERRY_TEST_UNSET", None),
                ("FERRY_TEST_EMPTY", Some("")),
            ],
            || {
                let result = interpolate("${FERRY_TEST_UNSET:-one} ${FERRY_TEST_UNSET-two}");
                assert_eq!(result.text, "one two");

                // `-` keeps an empty value, `:-` replaces it
                let result = interpolate("[${FERRY_TEST_EMPTY-x}] [${FERRY_TEST_EMPTY:-y}]");
                assert_eq!(result.text, "[] [y]");
            },
        );
    }

    #[test]
    fn test_newline_injection_rejected() {
        with_env_vars(&[("FERRY_TEST_NEWLINE", Some("a\nb"))], || {
            let result = interpolate("value: $FERRY_TEST_NEWLINE");
            assert!(!result.is_ok());
            assert!(result.errors[0].contains("newlines"));
        });
    }

    #[test]
    fn test_escape_sequence() {
        let result = interpolate("price: $$100");
        assert!(result.is_ok());
        assert_eq!(result.text, "price: $100");
    }
}
