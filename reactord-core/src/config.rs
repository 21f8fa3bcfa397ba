//! Parses the daemon's configuration file. The file contains a `settings`
//! block of name/value pairs plus any number of `reactor` blocks, each
//! mapping an event-tag glob pattern to an ordered list of reaction file
//! references. The reactor map may alternatively live in a standalone YAML
//! file named by the `reactor_map` setting, in which case the YAML file wins
//! over any inline `reactor` blocks.

use crate::reactor::map::{ReactorMapEntry, ReactorMapSource};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Number of worker tasks serving runner and wheel dispatches when the
/// `worker_threads` setting is absent.
pub const DEFAULT_WORKER_THREADS: usize = 10;

/// High-water mark of the worker queue when the `worker_hwm` setting is
/// absent.
pub const DEFAULT_WORKER_HWM: usize = 10_000;

/// Seconds a cached execution client is reused before being rebuilt, when
/// the `client_refresh_interval` setting is absent.
pub const DEFAULT_CLIENT_REFRESH_INTERVAL_SECS: u64 = 60;

pub struct ReactordConfig {
    pub settings: HashMap<String, Option<String>>,
    pub reactor_entries: Vec<ReactorMapEntry>,
}

#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("The config provided could not be parsed")]
    InvalidConfig(#[from] pest::error::Error<Rule>),

    #[error("Found unexpected rule '{rule:?}' in the {section} section")]
    UnexpectedRule { rule: Rule, section: String },

    #[error("Duplicate setting: '{name}'")]
    DuplicateSetting { name: String },

    #[error("Reactor block for pattern '{pattern}' has no reaction files")]
    EmptyReactorBlock { pattern: String },

    #[error("Setting '{name}' has the invalid value '{value}'")]
    InvalidSettingValue { name: String, value: String },
}

#[derive(Parser)]
#[grammar = "config.pest"]
struct RawConfigParser;

pub fn parse(content: &str) -> Result<ReactordConfig, ConfigParseError> {
    let mut config = ReactordConfig {
        settings: HashMap::new(),
        reactor_entries: Vec::new(),
    };

    let pairs = RawConfigParser::parse(Rule::content, content)?;
    for pair in pairs {
        match pair.as_rule() {
            Rule::setting_block => handle_setting_block(&mut config, pair)?,
            Rule::reactor_block => handle_reactor_block(&mut config, pair)?,
            _ => (),
        }
    }

    Ok(config)
}

fn handle_setting_block(
    config: &mut ReactordConfig,
    pair: Pair<Rule>,
) -> Result<(), ConfigParseError> {
    for pair in pair.into_inner() {
        match pair.as_rule() {
            Rule::setting => handle_setting(config, pair)?,
            rule => {
                return Err(ConfigParseError::UnexpectedRule {
                    rule,
                    section: "setting_block".to_string(),
                })
            }
        }
    }

    Ok(())
}

fn handle_setting(config: &mut ReactordConfig, pair: Pair<Rule>) -> Result<(), ConfigParseError> {
    let mut name = None;
    let mut value = None;

    for pair in pair.into_inner() {
        match pair.as_rule() {
            Rule::setting_name => name = Some(pair.as_str().to_string()),
            Rule::setting_value => value = setting_value_content(pair),
            rule => {
                return Err(ConfigParseError::UnexpectedRule {
                    rule,
                    section: "setting".to_string(),
                })
            }
        }
    }

    if let Some(name) = name {
        if config.settings.contains_key(&name) {
            return Err(ConfigParseError::DuplicateSetting { name });
        }

        config.settings.insert(name, value);
    }

    Ok(())
}

fn setting_value_content(pair: Pair<Rule>) -> Option<String> {
    let raw_value = pair.as_str().trim().to_string();
    let mut quoted_value = None;
    for pair in pair.into_inner() {
        if pair.as_rule() == Rule::quoted_string_value {
            quoted_value = Some(pair.as_str().to_string());
        }
    }

    let value = quoted_value.unwrap_or(raw_value);
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn handle_reactor_block(
    config: &mut ReactordConfig,
    pair: Pair<Rule>,
) -> Result<(), ConfigParseError> {
    let mut pattern = String::new();
    let mut reactions = Vec::new();

    for pair in pair.into_inner() {
        match pair.as_rule() {
            Rule::reactor_pattern => pattern = unquoted_content(pair),
            Rule::reaction_line => reactions.push(unquoted_content(pair)),
            rule => {
                return Err(ConfigParseError::UnexpectedRule {
                    rule,
                    section: "reactor_block".to_string(),
                })
            }
        }
    }

    if reactions.is_empty() {
        return Err(ConfigParseError::EmptyReactorBlock { pattern });
    }

    config.reactor_entries.push(ReactorMapEntry { pattern, reactions });
    Ok(())
}

fn unquoted_content(pair: Pair<Rule>) -> String {
    let raw = pair.as_str().trim().to_string();
    for pair in pair.into_inner() {
        match pair.as_rule() {
            Rule::quoted_string_value | Rule::bare_word => return pair.as_str().to_string(),
            _ => (),
        }
    }

    raw
}

impl ReactordConfig {
    /// Where the reactor map for this daemon lives. A `reactor_map` setting
    /// names a YAML file and takes precedence over inline `reactor` blocks;
    /// with neither present there is no map and no reactions can fire.
    pub fn reactor_map_source(&self) -> Option<ReactorMapSource> {
        if let Some(Some(path)) = self.settings.get("reactor_map") {
            return Some(ReactorMapSource::File(PathBuf::from(path)));
        }

        if !self.reactor_entries.is_empty() {
            return Some(ReactorMapSource::Inline(self.reactor_entries.clone()));
        }

        None
    }

    /// The directory virtual `salt://` reaction references resolve under.
    /// Defaults to the process's working directory.
    pub fn reaction_root(&self) -> PathBuf {
        match self.settings.get("reaction_root") {
            Some(Some(path)) => PathBuf::from(path),
            _ => PathBuf::from("."),
        }
    }

    pub fn worker_threads(&self) -> Result<usize, ConfigParseError> {
        self.usize_setting("worker_threads", DEFAULT_WORKER_THREADS)
    }

    pub fn worker_hwm(&self) -> Result<usize, ConfigParseError> {
        self.usize_setting("worker_hwm", DEFAULT_WORKER_HWM)
    }

    pub fn client_refresh_interval(&self) -> Result<Duration, ConfigParseError> {
        let secs = match self.settings.get("client_refresh_interval") {
            Some(Some(value)) => {
                value
                    .parse::<u64>()
                    .map_err(|_| ConfigParseError::InvalidSettingValue {
                        name: "client_refresh_interval".to_string(),
                        value: value.clone(),
                    })?
            }

            Some(None) => {
                return Err(ConfigParseError::InvalidSettingValue {
                    name: "client_refresh_interval".to_string(),
                    value: String::new(),
                })
            }

            None => DEFAULT_CLIENT_REFRESH_INTERVAL_SECS,
        };

        Ok(Duration::from_secs(secs))
    }

    fn usize_setting(&self, name: &str, default: usize) -> Result<usize, ConfigParseError> {
        match self.settings.get(name) {
            Some(Some(value)) => {
                value
                    .parse::<usize>()
                    .map_err(|_| ConfigParseError::InvalidSettingValue {
                        name: name.to_string(),
                        value: value.clone(),
                    })
            }

            Some(None) => Err(ConfigParseError::InvalidSettingValue {
                name: name.to_string(),
                value: String::new(),
            }),

            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_settings() {
        let content = "
settings {
    reaction_root /srv/reactions
    reactor_map \"/etc/reactord/map with spaces.yaml\"
    verbose

}
";

        let config = parse(content).unwrap();
        assert_eq!(config.settings.len(), 3, "Unexpected number of settings");
        assert_eq!(
            config.settings.get("reaction_root"),
            Some(&Some("/srv/reactions".to_string())),
            "Unexpected reaction_root value"
        );
        assert_eq!(
            config.settings.get("reactor_map"),
            Some(&Some("/etc/reactord/map with spaces.yaml".to_string())),
            "Unexpected reactor_map value"
        );
        assert_eq!(
            config.settings.get("verbose"),
            Some(&None),
            "Unexpected verbose value"
        );
    }

    #[test]
    fn can_read_single_reactor_block() {
        let content = "
reactor deploy/*/start {
    /srv/reactions/deploy.sls
    \"salt://reactions/notify.sls\"
}
";
        let config = parse(content).unwrap();
        assert_eq!(
            config.reactor_entries.len(),
            1,
            "Unexpected number of reactor entries"
        );

        let entry = &config.reactor_entries[0];
        assert_eq!(entry.pattern, "deploy/*/start", "Unexpected pattern");
        assert_eq!(
            entry.reactions,
            vec![
                "/srv/reactions/deploy.sls".to_string(),
                "salt://reactions/notify.sls".to_string(),
            ],
            "Unexpected reaction references"
        );
    }

    #[test]
    fn reactor_blocks_keep_config_order() {
        let content = "
reactor deploy/* {
    /srv/reactions/deploy.sls
}

reactor audit/* {
    /srv/reactions/audit.sls
}
";
        let config = parse(content).unwrap();
        assert_eq!(
            config.reactor_entries.len(),
            2,
            "Unexpected number of reactor entries"
        );
        assert_eq!(config.reactor_entries[0].pattern, "deploy/*");
        assert_eq!(config.reactor_entries[1].pattern, "audit/*");
    }

    #[test]
    fn duplicate_setting_returns_error() {
        let content = "
settings {
    worker_threads 4
    worker_threads 8
}
";
        match parse(content) {
            Err(ConfigParseError::DuplicateSetting { name }) => {
                assert_eq!(name, "worker_threads", "Unexpected setting name");
            }
            Err(e) => panic!("Expected duplicate setting error, instead got: {:?}", e),
            Ok(_) => panic!("Received successful parse, but an error was expected"),
        }
    }

    #[test]
    fn empty_reactor_block_returns_error() {
        let content = "
reactor deploy/* {
}
";
        match parse(content) {
            Err(ConfigParseError::EmptyReactorBlock { pattern }) => {
                assert_eq!(pattern, "deploy/*", "Unexpected pattern");
            }
            Err(e) => panic!("Expected empty reactor block error, instead got: {:?}", e),
            Ok(_) => panic!("Received successful parse, but an error was expected"),
        }
    }

    #[test]
    fn typed_settings_fall_back_to_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.worker_threads().unwrap(), DEFAULT_WORKER_THREADS);
        assert_eq!(config.worker_hwm().unwrap(), DEFAULT_WORKER_HWM);
        assert_eq!(
            config.client_refresh_interval().unwrap(),
            Duration::from_secs(DEFAULT_CLIENT_REFRESH_INTERVAL_SECS),
        );
        assert!(config.reactor_map_source().is_none());
    }

    #[test]
    fn typed_settings_parse_configured_values() {
        let content = "
settings {
    worker_threads 4
    worker_hwm 100
    client_refresh_interval 300
}
";
        let config = parse(content).unwrap();
        assert_eq!(config.worker_threads().unwrap(), 4);
        assert_eq!(config.worker_hwm().unwrap(), 100);
        assert_eq!(
            config.client_refresh_interval().unwrap(),
            Duration::from_secs(300),
        );
    }

    #[test]
    fn invalid_numeric_setting_returns_error() {
        let content = "
settings {
    worker_threads plenty
}
";
        let config = parse(content).unwrap();
        match config.worker_threads() {
            Err(ConfigParseError::InvalidSettingValue { name, value }) => {
                assert_eq!(name, "worker_threads");
                assert_eq!(value, "plenty");
            }
            other => panic!("Expected invalid setting value error, got: {:?}", other),
        }
    }

    #[test]
    fn reactor_map_file_wins_over_inline_entries() {
        let content = "
settings {
    reactor_map /etc/reactord/map.yaml
}

reactor deploy/* {
    /srv/reactions/deploy.sls
}
";
        let config = parse(content).unwrap();
        match config.reactor_map_source() {
            Some(ReactorMapSource::File(path)) => {
                assert_eq!(path, PathBuf::from("/etc/reactord/map.yaml"));
            }
            other => panic!("Expected file map source, got: {:?}", other),
        }
    }

    #[test]
    fn full_config_can_be_parsed() {
        let content = "
# comment
settings {
    reaction_root /srv/reactions # another comment
    worker_threads 4

}

reactor deploy/*/start { # reactor comment
    /srv/reactions/deploy.sls # reference comment
    salt://reactions/notify.sls
}

reactor audit/* {
    /srv/reactions/audit.sls
}
";
        parse(content).unwrap();
    }
}
