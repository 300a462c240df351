//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 4] = ["pretty", "compact", "json", "full"];

/// Validate a fully-merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::Invalid`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_server(config)?;
    validate_apps(config)?;
    validate_client(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_server(config: &Config) -> ConfigResult<()> {
    let s = &config.server;

    if s.host.trim().is_empty() {
        return Err(ConfigError::invalid("server.host", "must not be empty"));
    }
    for (field, port) in [
        ("server.control_port", s.control_port),
        ("server.push_port", s.push_port),
        ("server.render_port_base", s.render_port_base),
    ] {
        if port == 0 {
            return Err(ConfigError::invalid(field, "port must be non-zero"));
        }
    }
    if s.control_port == s.push_port {
        return Err(ConfigError::invalid(
            "server.push_port",
            format!("collides with control_port {}", s.control_port),
        ));
    }
    if s.render_port_limit == 0 {
        return Err(ConfigError::invalid(
            "server.render_port_limit",
            "must be at least 1",
        ));
    }

    let Some(end) = s.render_port_end() else {
        return Err(ConfigError::invalid(
            "server.render_port_limit",
            format!(
                "range starting at {} with {} ports runs past 65535",
                s.render_port_base, s.render_port_limit
            ),
        ));
    };
    let range = s.render_port_base..=end;
    for (name, port) in [("control_port", s.control_port), ("push_port", s.push_port)] {
        if range.contains(&port) {
            return Err(ConfigError::invalid(
                "server.render_port_base",
                format!(
                    "render range {}-{end} overlaps {name} {port}",
                    s.render_port_base
                ),
            ));
        }
    }
    Ok(())
}

fn validate_apps(config: &Config) -> ConfigResult<()> {
    let a = &config.apps;
    for (field, name) in [
        ("apps.template_file", &a.template_file),
        ("apps.script_file", &a.script_file),
        ("apps.style_file", &a.style_file),
    ] {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                field,
                format!("'{name}' must be a plain file name"),
            ));
        }
    }
    Ok(())
}

fn validate_client(config: &Config) -> ConfigResult<()> {
    if config.client.max_attempts == 0 {
        return Err(ConfigError::invalid(
            "client.max_attempts",
            "must be at least 1",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !LOG_LEVELS.contains(&l.level.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::invalid(
            "logging.level",
            format!(
                "unknown level '{}'; expected one of: {}",
                l.level,
                LOG_LEVELS.join(", ")
            ),
        ));
    }
    if !LOG_FORMATS.contains(&l.format.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::invalid(
            "logging.format",
            format!(
                "unknown format '{}'; expected one of: {}",
                l.format,
                LOG_FORMATS.join(", ")
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(result: ConfigResult<()>) -> String {
        match result {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = Config::default();
        config.server.push_port = 0;
        assert_eq!(field_of(validate(&config)), "server.push_port");
    }

    #[test]
    fn test_empty_render_range_rejected() {
        let mut config = Config::default();
        config.server.render_port_limit = 0;
        assert_eq!(field_of(validate(&config)), "server.render_port_limit");
    }

    #[test]
    fn test_render_range_overlapping_control_port_rejected() {
        let mut config = Config::default();
        config.server.render_port_base = 2990;
        config.server.render_port_limit = 20;
        assert_eq!(field_of(validate(&config)), "server.render_port_base");

        // Adjacent but not overlapping.
        config.server.render_port_limit = 10;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_render_range_past_u16_rejected() {
        let mut config = Config::default();
        config.server.render_port_base = 65_530;
        config.server.render_port_limit = 10;
        assert_eq!(field_of(validate(&config)), "server.render_port_limit");
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = Config::default();
        config.client.max_attempts = 0;
        assert_eq!(field_of(validate(&config)), "client.max_attempts");
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert_eq!(field_of(validate(&config)), "logging.format");
        config.logging.format = "JSON".to_owned();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_script_file_must_be_plain_name() {
        let mut config = Config::default();
        config.apps.script_file = "../evil.rhai".to_owned();
        assert_eq!(field_of(validate(&config)), "apps.script_file");
    }
}
