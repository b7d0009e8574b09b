//! Configuration and startup error types

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing secret: {0}")]
    MissingSecret(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let config_err = Error::Config("upstream.timeout_secs must be > 0".into());
        assert_eq!(
            config_err.to_string(),
            "Configuration error: upstream.timeout_secs must be > 0"
        );

        let secret_err = Error::MissingSecret("VALID_API_KEY".into());
        assert_eq!(secret_err.to_string(), "Missing secret: VALID_API_KEY");
    }

    #[test]
    fn io_errors_convert_with_prefix() {
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "accounts.txt").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
    }

    #[test]
    fn toml_errors_convert() {
        let parse = toml::from_str::<toml::Table>("not = [valid").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Toml(_)));
    }
}
