use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use agentrun_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key_path: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

pub fn run(options: LoadOptions) -> String {
    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key_path,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key_path, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let optional = |value: Option<String>| value.unwrap_or_else(|| "<unset>".to_string());

    vec![
        Field {
            key_path: "llm.provider",
            env_keys: &["AGENTRUN_LLM_PROVIDER"],
            value: config.llm.provider.as_str().to_string(),
        },
        Field {
            key_path: "llm.model",
            env_keys: &["AGENTRUN_LLM_MODEL"],
            value: config.llm.model.clone(),
        },
        Field {
            key_path: "llm.base_url",
            env_keys: &["AGENTRUN_LLM_BASE_URL"],
            value: optional(config.llm.base_url.clone()),
        },
        Field {
            key_path: "llm.api_key",
            env_keys: &["AGENTRUN_LLM_API_KEY"],
            value: if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" }.to_string(),
        },
        Field {
            key_path: "llm.timeout_secs",
            env_keys: &["AGENTRUN_LLM_TIMEOUT_SECS"],
            value: config.llm.timeout_secs.to_string(),
        },
        Field {
            key_path: "llm.temperature",
            env_keys: &["AGENTRUN_LLM_TEMPERATURE"],
            value: optional(config.llm.temperature.map(|value| value.to_string())),
        },
        Field {
            key_path: "llm.max_tokens",
            env_keys: &["AGENTRUN_LLM_MAX_TOKENS"],
            value: optional(config.llm.max_tokens.map(|value| value.to_string())),
        },
        Field {
            key_path: "engine.max_iterations",
            env_keys: &["AGENTRUN_ENGINE_MAX_ITERATIONS"],
            value: config.engine.max_iterations.to_string(),
        },
        Field {
            key_path: "engine.debug_mode",
            env_keys: &["AGENTRUN_ENGINE_DEBUG_MODE"],
            value: config.engine.debug_mode.to_string(),
        },
        Field {
            key_path: "stats.endpoint",
            env_keys: &["AGENTRUN_STATS_ENDPOINT"],
            value: optional(config.stats.endpoint.clone()),
        },
        Field {
            key_path: "stats.timeout_secs",
            env_keys: &["AGENTRUN_STATS_TIMEOUT_SECS"],
            value: config.stats.timeout_secs.to_string(),
        },
        Field {
            key_path: "logging.level",
            env_keys: &["AGENTRUN_LOGGING_LEVEL", "AGENTRUN_LOG_LEVEL"],
            value: config.logging.level.clone(),
        },
        Field {
            key_path: "logging.format",
            env_keys: &["AGENTRUN_LOGGING_FORMAT", "AGENTRUN_LOG_FORMAT"],
            value: format!("{:?}", config.logging.format).to_lowercase(),
        },
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("agentrun.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/agentrun.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
