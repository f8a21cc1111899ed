//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "pipewright.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "pipewright.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".pipewright.toml",
        ".pipewright.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# pipewright configuration

[pipeline]
id = "stages"

[stash]
enabled = true
dir = ".pipewright/stash"

[execution]
concurrency = 4

[toolchain.binaries]

[settings]
source_dir = "src"
build_dir = "build"
sources = ["**/*.txt"]

[[settings.stages]]
name = "copy"
command = "cp {input} {output}"
extension = "txt"
"#;
