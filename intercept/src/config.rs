use serde::Deserialize;

const VERIFY_PATCHES_ENV: &str = "EASYJECTION_VERIFY_PATCHES";
const LOG_INVOCATIONS_ENV: &str = "EASYJECTION_LOG_INVOCATIONS";

/// Runtime switches for an [`Interceptor`](crate::Interceptor).
///
/// Deserializable so hosts can embed it in their own configuration files;
/// missing fields fall back to [`Default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Read back every patch write and fail with `VerificationFailed` on mismatch.
    pub verify_patches: bool,
    /// Log each pipeline transition at `debug` instead of `trace`.
    pub log_invocations: bool,
}

impl InterceptorConfig {
    /// Defaults overridden by `EASYJECTION_VERIFY_PATCHES` and
    /// `EASYJECTION_LOG_INVOCATIONS`.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup(VERIFY_PATCHES_ENV) {
            self.verify_patches = env_flag(&v);
        }
        if let Some(v) = lookup(LOG_INVOCATIONS_ENV) {
            self.log_invocations = env_flag(&v);
        }
        self
    }
}

fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_off() {
        let config = InterceptorConfig::default();
        assert!(!config.verify_patches);
        assert!(!config.log_invocations);
    }

    #[test]
    fn deserialize_fills_missing_fields() {
        let config: InterceptorConfig =
            serde_json::from_str(r#"{"verify_patches": true}"#).unwrap();
        assert!(config.verify_patches);
        assert!(!config.log_invocations);

        let empty: InterceptorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, InterceptorConfig::default());
    }

    #[test]
    fn env_overrides_accept_common_truthy_spellings() {
        let vars: HashMap<&str, &str> = [
            (VERIFY_PATCHES_ENV, "Yes"),
            (LOG_INVOCATIONS_ENV, "0"),
        ]
        .into_iter()
        .collect();
        let config = InterceptorConfig {
            verify_patches: false,
            log_invocations: true,
        }
        .with_env(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.verify_patches);
        assert!(!config.log_invocations);
    }
}
