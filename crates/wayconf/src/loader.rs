//! Where config comes from: the file search path, TOML merging and the
//! `WAYPOST_*` environment overlay.

use crate::{ConfigError, WaypostConfig};
use std::env;
use std::path::{Path, PathBuf};

const SYSTEM_FILE: &str = "/etc/waypost/config.toml";
const USER_FILE: &str = "waypost/config.toml";
const LOCAL_FILE: &str = "waypost.toml";

/// What went into an effective config, in application order.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub files: Vec<PathBuf>,
    /// Names of the variables that were applied.
    pub env_overrides: Vec<String>,
}

/// Existing config files, lowest precedence first.
///
/// An `explicit` file that exists takes the place of `./waypost.toml`.
pub fn config_files(explicit: Option<&Path>) -> Vec<PathBuf> {
    let user = directories::BaseDirs::new().map(|dirs| dirs.config_dir().join(USER_FILE));
    let last = explicit
        .filter(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(LOCAL_FILE));

    [Some(PathBuf::from(SYSTEM_FILE)), user, Some(last)]
        .into_iter()
        .flatten()
        .filter(|p| p.exists())
        .collect()
}

pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    text.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deserialize a (possibly merged) table. `origin` names it in errors.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<WaypostConfig, ConfigError> {
    let mut config: WaypostConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.paths.store_dir = expand_path(&config.paths.store_dir.to_string_lossy());
    Ok(config)
}

/// Merge `overlay` into `base`, key by key. Nested tables merge recursively,
/// everything else in `overlay` replaces what `base` had.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

type Setter = fn(&mut WaypostConfig, &str) -> bool;

/// Later entries win, so `OTEL_EXPORTER_OTLP_ENDPOINT` and `RUST_LOG` beat
/// their `WAYPOST_*` spellings.
const ENV_OVERRIDES: &[(&str, Setter)] = &[
    ("WAYPOST_STORE_DIR", |c, v| {
        c.paths.store_dir = expand_path(v);
        true
    }),
    ("WAYPOST_OTLP_ENDPOINT", |c, v| {
        c.telemetry.otlp_endpoint = v.to_string();
        true
    }),
    ("OTEL_EXPORTER_OTLP_ENDPOINT", |c, v| {
        c.telemetry.otlp_endpoint = v.to_string();
        true
    }),
    ("WAYPOST_LOG_LEVEL", |c, v| {
        c.telemetry.log_level = v.to_string();
        true
    }),
    ("RUST_LOG", |c, v| {
        c.telemetry.log_level = v.to_string();
        true
    }),
    ("WAYPOST_SESSION_TIMEOUT_MS", |c, v| {
        v.trim().parse::<u64>().map(|ms| c.session.timeout_ms = ms).is_ok()
    }),
    ("WAYPOST_URL", |c, v| {
        c.transport.url = v.to_string();
        true
    }),
    ("WAYPOST_FALLBACK_URL", |c, v| {
        c.transport.fallback_url = v.to_string();
        true
    }),
    ("WAYPOST_QUEUE_SIZE", |c, v| {
        v.trim()
            .parse::<usize>()
            .map(|size| c.transport.message_queue_size = size)
            .is_ok()
    }),
];

/// Overlay every set (and parseable) override onto `config`.
pub fn apply_env_overrides(config: &mut WaypostConfig, sources: &mut ConfigSources) {
    apply_overrides(config, sources, |name| env::var(name).ok());
}

fn apply_overrides(
    config: &mut WaypostConfig,
    sources: &mut ConfigSources,
    lookup: impl Fn(&str) -> Option<String>,
) {
    for (name, set) in ENV_OVERRIDES {
        if let Some(value) = lookup(name) {
            if set(config, &value) {
                sources.env_overrides.push((*name).to_string());
            }
        }
    }
}

/// Resolve a leading `~/` or `$VAR` in a path. Unresolvable prefixes are
/// left as written.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        return match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(rest),
            None => PathBuf::from(path),
        };
    }
    let Some(var) = path.strip_prefix('$') else {
        return PathBuf::from(path);
    };
    let (name, rest) = var.split_once('/').unwrap_or((var, ""));
    match env::var(name) {
        Ok(root) if rest.is_empty() => PathBuf::from(root),
        Ok(root) => Path::new(&root).join(rest),
        Err(_) => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table(s: &str) -> toml::Table {
        s.parse().unwrap()
    }

    #[test]
    fn home_prefix_is_resolved() {
        let expanded = expand_path("~/waypost/store");
        assert!(expanded.ends_with("waypost/store"));
        assert!(!expanded.starts_with("~"));
    }

    #[test]
    fn plain_and_unknown_variable_paths_are_untouched() {
        assert_eq!(expand_path("/var/lib/waypost"), PathBuf::from("/var/lib/waypost"));
        assert_eq!(
            expand_path("$WAYPOST_SURELY_UNSET_VAR/x"),
            PathBuf::from("$WAYPOST_SURELY_UNSET_VAR/x")
        );
    }

    #[test]
    fn missing_explicit_file_falls_back_to_search_path() {
        let files = config_files(Some(Path::new("/nonexistent/waypost.toml")));
        assert!(files.iter().all(|f| f.exists()));
    }

    #[test]
    fn overrides_apply_in_order_and_skip_garbage() {
        let vars: HashMap<&str, &str> = [
            ("WAYPOST_LOG_LEVEL", "info"),
            ("RUST_LOG", "trace"),
            ("WAYPOST_QUEUE_SIZE", "lots"),
            ("WAYPOST_URL", "ws://env"),
        ]
        .into_iter()
        .collect();

        let mut config = WaypostConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides(&mut config, &mut sources, |name| {
            vars.get(name).map(|v| v.to_string())
        });

        assert_eq!(config.telemetry.log_level, "trace");
        assert_eq!(config.transport.url, "ws://env");
        assert_eq!(
            config.transport.message_queue_size,
            WaypostConfig::default().transport.message_queue_size
        );
        assert_eq!(
            sources.env_overrides,
            vec!["WAYPOST_LOG_LEVEL", "RUST_LOG", "WAYPOST_URL"]
        );
    }

    #[test]
    fn merge_is_field_by_field() {
        let mut base = table(
            r#"
[transport]
url = "ws://base"
message_queue_size = 10
"#,
        );
        merge_tables(
            &mut base,
            table(
                r#"
[transport]
url = "ws://overlay"
"#,
            ),
        );

        let config = from_table(base, Path::new("test.toml")).unwrap();
        assert_eq!(config.transport.url, "ws://overlay");
        assert_eq!(config.transport.message_queue_size, 10);
    }

    #[test]
    fn every_section_parses() {
        let toml = r#"
[paths]
store_dir = "/data/waypost"

[telemetry]
log_level = "debug"

[session]
timeout_ms = 60000
cross_tab_sync = false

[session.fingerprint]
plugins = false
canvas = true

[transport]
url = "wss://collector/ws"
fallback_url = "https://collector/beacon"
max_missed_heartbeats = 5
"#;
        let config = from_table(table(toml), Path::new("test.toml")).unwrap();

        assert_eq!(config.paths.store_dir, PathBuf::from("/data/waypost"));
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.session.timeout_ms, 60000);
        assert!(!config.session.cross_tab_sync);
        assert!(!config.session.fingerprint.plugins);
        assert!(config.session.fingerprint.canvas);
        assert_eq!(config.transport.url, "wss://collector/ws");
        assert_eq!(config.transport.fallback_url, "https://collector/beacon");
        assert_eq!(config.transport.max_missed_heartbeats, 5);
        assert_eq!(config.transport.connection_timeout_ms, 10_000);
    }

    #[test]
    fn bad_type_reports_origin() {
        let err = from_table(
            table("[transport]\nmessage_queue_size = \"lots\""),
            Path::new("broken.toml"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
