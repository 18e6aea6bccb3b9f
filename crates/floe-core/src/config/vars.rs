//! Environment variable interpolation for config files.
//!
//! Supports:
//! - `${VAR}` - substitute with the env var's value, error if missing
//! - `${VAR:-default}` - use the default if VAR is unset or empty
//! - `$$` - escape sequence for a literal `$`

use std::env;
use std::sync::LazyLock;

use regex::Regex;

static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # escape sequence $$
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)   # variable name
            (?:
                :-
                ([^}]*)                # optional default value
            )?
        \}
        ",
    )
    .expect("invalid interpolation pattern")
});

/// Result of environment variable interpolation.
///
/// Errors are accumulated rather than failing fast so the user sees every
/// missing variable at once.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let full_match = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if full_match == "$$" {
                return "$".to_string();
            }

            let var_name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let default_value = caps.get(2).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(value) if !value.is_empty() => value,
                Ok(_) | Err(env::VarError::NotPresent) => match default_value {
                    Some(default) => default.to_string(),
                    None => {
                        errors.push(format!("environment variable '{var_name}' is not set"));
                        full_match.to_string()
                    }
                },
                Err(e) => {
                    errors.push(format!("environment variable '{var_name}': {e}"));
                    full_match.to_string()
                }
            }
        })
        .to_string();

    InterpolationResult { text, errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_set_variable() {
        // Safety: test-only env mutation, name unique to this test.
        unsafe { env::set_var("FLOE_VARS_TEST_ROOT", "/data/floe") };
        let result = interpolate("root: ${FLOE_VARS_TEST_ROOT}");
        assert!(result.is_ok());
        assert_eq!(result.text, "root: /data/floe");
    }

    #[test]
    fn missing_variable_without_default_is_an_error() {
        let result = interpolate("root: ${FLOE_VARS_TEST_UNSET}");
        assert!(!result.is_ok());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("FLOE_VARS_TEST_UNSET"));
    }

    #[test]
    fn missing_variable_with_default_uses_default() {
        let result = interpolate("addr: ${FLOE_VARS_TEST_ADDR:-0.0.0.0:9090}");
        assert!(result.is_ok());
        assert_eq!(result.text, "addr: 0.0.0.0:9090");
    }

    #[test]
    fn dollar_escape() {
        let result = interpolate("cost: $$5");
        assert!(result.is_ok());
        assert_eq!(result.text, "cost: $5");
    }

    #[test]
    fn accumulates_all_errors() {
        let result = interpolate("${FLOE_VARS_TEST_A} ${FLOE_VARS_TEST_B}");
        assert_eq!(result.errors.len(), 2);
    }
}
