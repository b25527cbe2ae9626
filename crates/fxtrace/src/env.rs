use std::env;
use std::sync::OnceLock;

static FXTRACE_STACK_TRACES: OnceLock<bool> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Reads a variable, treating unset and blank values alike.
pub(crate) fn var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn stack_traces_enabled() -> bool {
    *FXTRACE_STACK_TRACES.get_or_init(|| match var("FXTRACE_STACK_TRACES") {
        Some(value) => parse_bool(&value),
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
