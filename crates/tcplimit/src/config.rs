//! Configuration for a [`Limiter`](crate::Limiter).

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::Limit;

/// Initial limits for a [`Limiter`](crate::Limiter).
///
/// Both limits default to [`Limit::INF`].  In configuration files a limit is
/// a number of bytes per second, or the string `"unlimited"`.
///
/// ```
/// use tcplimit::{Limit, LimiterConfig};
///
/// let config = LimiterConfig::builder()
///     .global_limit(64.0 * 1024.0)
///     .local_limit(Limit::new(8.0 * 1024.0))
///     .build()
///     .unwrap();
/// assert_eq!(config.local_limit(), Limit::new(8192.0));
/// ```
#[derive(Debug, Clone, Builder, PartialEq, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
#[builder(derive(Debug))]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    /// Aggregate rate of every connection wrapped by the limiter.
    #[builder(default, setter(into))]
    pub(crate) global_limit: Limit,

    /// Rate of each individual connection.
    #[builder(default, setter(into))]
    pub(crate) local_limit: Limit,
}

impl LimiterConfig {
    /// Return a new builder for a `LimiterConfig`.
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder::default()
    }

    /// Return the configured global limit.
    pub fn global_limit(&self) -> Limit {
        self.global_limit
    }

    /// Return the configured per-connection limit.
    pub fn local_limit(&self) -> Limit {
        self.local_limit
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            global_limit: Limit::INF,
            local_limit: Limit::INF,
        }
    }
}

impl LimiterConfigBuilder {
    /// Reject negative or NaN limits.
    fn validate(&self) -> Result<(), String> {
        for (name, limit) in [
            ("global_limit", self.global_limit),
            ("local_limit", self.local_limit),
        ] {
            match limit {
                Some(limit) if !limit.is_valid() => {
                    return Err(format!("{}: invalid limit {}", name, limit))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;

    #[test]
    fn defaults() {
        let config = LimiterConfig::builder().build().unwrap();
        assert_eq!(config, LimiterConfig::default());
        assert_eq!(config.global_limit(), Limit::INF);
        assert_eq!(config.local_limit(), Limit::INF);
    }

    #[test]
    fn rejects_invalid() {
        let err = LimiterConfig::builder()
            .local_limit(-1.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("local_limit"));

        assert!(LimiterConfig::builder()
            .global_limit(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn from_toml() {
        let config: LimiterConfig = toml::from_str(
            r#"
            global_limit = 65536
            local_limit = "unlimited"
            "#,
        )
        .unwrap();
        assert_eq!(config.global_limit(), Limit::new(65536.0));
        assert_eq!(config.local_limit(), Limit::INF);

        let config: LimiterConfig = toml::from_str("local_limit = 512.5").unwrap();
        assert_eq!(config.global_limit(), Limit::INF);
        assert_eq!(config.local_limit(), Limit::new(512.5));
    }

    #[test]
    fn bad_toml() {
        assert!(toml::from_str::<LimiterConfig>("global_limit = -5").is_err());
        assert!(toml::from_str::<LimiterConfig>(r#"global_limit = "lots""#).is_err());
        assert!(toml::from_str::<LimiterConfig>("burst = 3").is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = LimiterConfig::builder()
            .global_limit(1000.0)
            .build()
            .unwrap();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains(r#"local_limit = "unlimited""#));
        let back: LimiterConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
