//! Resolves an event tag to the ordered list of reaction file references
//! configured for it. The map is either a list of entries taken straight
//! from the daemon config or a YAML file that is re-read for every event, so
//! live edits to the file take effect without a restart.

use glob::Pattern;
use serde_yaml::Value as YamlValue;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// One configured mapping from an event-tag glob pattern to the reaction
/// files that should run when a tag matches it.
#[derive(Clone, Debug, PartialEq)]
pub struct ReactorMapEntry {
    pub pattern: String,
    pub reactions: Vec<String>,
}

/// Where the reactor map comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ReactorMapSource {
    Inline(Vec<ReactorMapEntry>),
    File(PathBuf),
}

/// Returns the reaction references for every entry whose pattern matches the
/// tag, preserving the configured order (first match order, not pattern
/// specificity). An unreadable or unparsable map file is logged and treated
/// as an empty map so the event loop keeps running.
pub fn matching_reactions(source: &ReactorMapSource, tag: &str) -> Vec<String> {
    debug!(tag = %tag, "Gathering reactions for tag '{}'", tag);

    let loaded;
    let entries = match source {
        ReactorMapSource::Inline(entries) => entries.as_slice(),
        ReactorMapSource::File(path) => match load_map_file(path) {
            Ok(entries) => {
                loaded = entries;
                loaded.as_slice()
            }

            Err(error) => {
                error!(
                    path = %path.display(),
                    "Failed to load reactor map '{}': {:#}", path.display(), error,
                );

                return Vec::new();
            }
        },
    };

    let mut reactions = Vec::new();
    for entry in entries {
        let pattern = match Pattern::new(&entry.pattern) {
            Ok(pattern) => pattern,
            Err(error) => {
                debug!(
                    pattern = %entry.pattern,
                    "Skipping invalid reactor pattern '{}': {}", entry.pattern, error,
                );

                continue;
            }
        };

        if pattern.matches(tag) {
            reactions.extend(entry.reactions.iter().cloned());
        }
    }

    reactions
}

fn load_map_file(path: &Path) -> anyhow::Result<Vec<ReactorMapEntry>> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;

    parse_map(&content).with_context(|| format!("failed to parse YAML in '{}'", path.display()))
}

/// Parses the reactor map's YAML form: a sequence of single-key mappings,
/// each mapping a glob pattern to a reaction reference or list of
/// references. The sequence may also sit under a top-level `reactor` key.
/// Elements that are not single-key mappings, or whose value is neither a
/// string nor a list of strings, are silently skipped.
pub fn parse_map(content: &str) -> anyhow::Result<Vec<ReactorMapEntry>> {
    let root: YamlValue = serde_yaml::from_str(content)?;

    let sequence = match root {
        YamlValue::Sequence(sequence) => sequence,
        YamlValue::Mapping(mapping) => {
            let reactor_value = mapping
                .into_iter()
                .find(|(key, _)| key.as_str() == Some("reactor"))
                .map(|(_, value)| value);

            match reactor_value {
                Some(YamlValue::Sequence(sequence)) => sequence,
                _ => anyhow::bail!(
                    "expected a sequence of pattern mappings, or a mapping with a 'reactor' sequence"
                ),
            }
        }

        _ => anyhow::bail!(
            "expected a sequence of pattern mappings, or a mapping with a 'reactor' sequence"
        ),
    };

    let mut entries = Vec::new();
    for element in sequence {
        let YamlValue::Mapping(mapping) = element else {
            continue;
        };

        if mapping.len() != 1 {
            continue;
        }

        let Some((key, value)) = mapping.into_iter().next() else {
            continue;
        };

        let YamlValue::String(pattern) = key else {
            continue;
        };

        let reactions = match value {
            YamlValue::String(reference) => vec![reference],
            YamlValue::Sequence(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    YamlValue::String(reference) => Some(reference),
                    _ => None,
                })
                .collect(),

            _ => continue,
        };

        entries.push(ReactorMapEntry { pattern, reactions });
    }

    Ok(entries)
}
