//! Tracing bootstrap for registry processes.
//!
//! The storage engine itself only emits `tracing` events; whichever process
//! hosts it calls [`init_subscriber`] once with the `log` entry of the
//! registry configuration.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

/// Where log records are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// How log records are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    PrettyTimestamped,
    Json,
}

/// Registry log levels. `http` and `fatal` have no tracing equivalent and are
/// folded into `info` and `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    #[default]
    Http,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Http | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// The `log` section of the registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(rename = "type", default)]
    pub target: LogTarget,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub level: LogLevel,
    /// Log file location, only read when `type: file`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl LogConfig {
    fn file_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("pkgstore.log"))
    }
}

// --- Tag-Based Filtering Logic ---
#[derive(Clone, Debug, PartialEq)]
struct Tag {
    key: String,
    value: String,
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let mut parts = s.splitn(2, ':');
            let key = parts.next()?.trim().to_string();
            let value = parts.next()?.trim().to_string();
            if key.is_empty() {
                return None;
            }
            Some(Tag { key, value })
        })
        .collect()
}

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        let mut visitor = FieldVisitor(&mut fields);
        attrs.record(&mut visitor);
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let scope = match ctx.current_span().id().and_then(|id| ctx.span_scope(id)) {
            Some(scope) => scope,
            None => return false, // If tags are specified, events outside a span are filtered.
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| {
            all_fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));
    for noisy in ["tokio=warn", "hyper=warn"] {
        if let Ok(directive) = noisy.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Installs the global tracing subscriber described by `config`.
///
/// Returns the appender guard when logging to a file; it must be kept alive
/// for the lifetime of the process or buffered records are lost.
pub fn init_subscriber(config: &LogConfig) -> Option<WorkerGuard> {
    let tag_filter_layer = TagFilterLayer {
        filters: parse_tags(&env::var("LOG_TAGS").unwrap_or_default()),
    };
    let subscriber = registry()
        .with(build_filter(config))
        .with(tag_filter_layer);

    macro_rules! finish {
        ($writer:expr) => {{
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer($writer);
            let result = match config.format {
                LogFormat::Json => subscriber.with(fmt_layer.json()).try_init(),
                LogFormat::PrettyTimestamped => subscriber.with(fmt_layer.pretty()).try_init(),
                LogFormat::Pretty => subscriber
                    .with(fmt_layer.compact().without_time())
                    .try_init(),
            };
            if let Err(e) = result {
                eprintln!("pkgstore-logging: subscriber already installed: {e}");
            }
        }};
    }

    match config.target {
        LogTarget::Stdout => {
            finish!(std::io::stdout);
            None
        }
        LogTarget::Stderr => {
            finish!(std::io::stderr);
            None
        }
        LogTarget::File => {
            let log_path = config.file_path();
            let log_dir = log_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(env::temp_dir);
            let log_filename = log_path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "pkgstore.log".into());
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            finish!(non_blocking);
            Some(guard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::Http.as_filter(), "info");
        assert_eq!(LogLevel::Fatal.as_filter(), "error");
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }

    #[test]
    fn test_deserialize_log_config() {
        let yaml = "type: file\nformat: pretty-timestamped\nlevel: debug\npath: /var/log/reg.log\n";
        let config: LogConfig = serde_yaml_ng::from_str(yaml).expect("should parse log config");
        assert_eq!(config.target, LogTarget::File);
        assert_eq!(config.format, LogFormat::PrettyTimestamped);
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.file_path(), PathBuf::from("/var/log/reg.log"));
    }

    #[test]
    fn test_log_config_rejects_unknown_fields() {
        let yaml = "type: stdout\ncolour: true\n";
        assert!(serde_yaml_ng::from_str::<LogConfig>(yaml).is_err());
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("package:foo, backend:*,broken");
        assert_eq!(
            tags,
            vec![
                Tag {
                    key: "package".to_string(),
                    value: "foo".to_string()
                },
                Tag {
                    key: "backend".to_string(),
                    value: "*".to_string()
                },
            ]
        );
        assert!(parse_tags("").is_empty());
    }
}
