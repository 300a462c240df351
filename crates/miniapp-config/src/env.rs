//! `MINIAPP_*` environment overrides.
//!
//! Unlike file layers, environment variables are applied last and win over
//! every file. Only the variables in [`ENV_OVERRIDES`] are recognised.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Prefix shared by all recognised variables.
pub const ENV_PREFIX: &str = "MINIAPP_";

#[derive(Debug, Clone, Copy)]
enum Kind {
    Port,
    Str,
}

/// Variable name, dotted config path, value kind.
const ENV_OVERRIDES: [(&str, &str, Kind); 5] = [
    ("MINIAPP_CONTROL_PORT", "server.control_port", Kind::Port),
    ("MINIAPP_PUSH_PORT", "server.push_port", Kind::Port),
    ("MINIAPP_RENDER_PORT_BASE", "server.render_port_base", Kind::Port),
    ("MINIAPP_APPS_DIR", "apps.dir", Kind::Str),
    ("MINIAPP_LOG_LEVEL", "logging.level", Kind::Str),
];

/// Snapshot the process environment, keeping only `MINIAPP_*` variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .collect()
}

/// Write recognised overrides from `env` into `tree`.
///
/// Returns how many overrides were applied.
///
/// # Errors
///
/// [`ConfigError::Invalid`] if a port variable is not a valid port number.
pub fn apply_env_overrides(
    tree: &mut toml::Value,
    env: &HashMap<String, String>,
) -> ConfigResult<usize> {
    let mut applied = 0;
    for (var, path, kind) in ENV_OVERRIDES {
        let Some(raw) = env.get(var) else {
            continue;
        };
        let value = match kind {
            Kind::Port => {
                let port: u16 = raw.trim().parse().map_err(|_| {
                    ConfigError::invalid(path, format!("{var}='{raw}' is not a port number"))
                })?;
                toml::Value::Integer(i64::from(port))
            },
            Kind::Str => toml::Value::String(raw.clone()),
        };
        set_path(tree, path, value);
        debug!(var, path, "applied environment override");
        applied += 1;
    }
    Ok(applied)
}

/// Set a dotted `path` in `tree`, creating intermediate tables.
fn set_path(tree: &mut toml::Value, path: &str, value: toml::Value) {
    let mut node = tree;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !node.is_table() {
            *node = toml::Value::Table(toml::map::Map::new());
        }
        let toml::Value::Table(table) = node else {
            return;
        };
        if parts.peek().is_none() {
            table.insert(part.to_owned(), value);
            return;
        }
        node = table
            .entry(part.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_overrides_write_into_tree() {
        let mut tree: toml::Value = toml::from_str("[server]\ncontrol_port = 3000").unwrap();
        let applied = apply_env_overrides(
            &mut tree,
            &env(&[
                ("MINIAPP_CONTROL_PORT", "8080"),
                ("MINIAPP_APPS_DIR", "/srv/apps"),
                ("MINIAPP_UNRELATED", "x"),
            ]),
        )
        .unwrap();

        assert_eq!(applied, 2);
        assert_eq!(tree["server"]["control_port"].as_integer(), Some(8080));
        assert_eq!(tree["apps"]["dir"].as_str(), Some("/srv/apps"));
    }

    #[test]
    fn test_bad_port_is_invalid() {
        let mut tree = toml::Value::Table(toml::map::Map::new());
        let err = apply_env_overrides(&mut tree, &env(&[("MINIAPP_PUSH_PORT", "70000")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "server.push_port"));
    }

    #[test]
    fn test_no_overrides() {
        let mut tree = toml::Value::Table(toml::map::Map::new());
        assert_eq!(apply_env_overrides(&mut tree, &HashMap::new()).unwrap(), 0);
    }
}
