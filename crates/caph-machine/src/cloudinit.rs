//! Merging of cloud-init user-data fragments.
//!
//! Fragments come from independent authors (guest agent setup, SSH keys, the
//! bootstrap provider). Each is parsed as YAML on its own and folded into a
//! single document according to a per-key [`MergeStrategy`]. Only the merged
//! result has to be a valid cloud-config; a fragment may, for instance, carry
//! nothing but a `runcmd` list.

use std::collections::HashMap;

use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// How values for one top-level key combine across fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Concatenate in fragment order. Sequence values contribute each entry;
    /// any other value is appended as a single entry.
    ListAppend,
    /// Last fragment setting the key wins.
    ScalarOverride,
    /// Fragments may repeat the key only with an identical value.
    ErrorOnConflict,
}

const LIST_SECTIONS: &[&str] = &[
    "packages",
    "runcmd",
    "ssh_authorized_keys",
    "groups",
    "users",
    "write_files",
    "bootcmd",
];

/// A parsed cloud-config document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudInitDocument(Mapping);

impl CloudInitDocument {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize with the `#cloud-config` marker cloud-init requires on the
    /// first line.
    pub fn render(&self) -> Result<String> {
        let body = serde_yaml::to_string(&self.0).map_err(Error::Render)?;
        Ok(format!("{CLOUD_CONFIG_HEADER}{body}"))
    }
}

/// Folds fragments into one document using a strategy table.
#[derive(Debug, Clone)]
pub struct CloudInitMerger {
    strategies: HashMap<String, MergeStrategy>,
    fallback: MergeStrategy,
}

impl Default for CloudInitMerger {
    fn default() -> Self {
        let mut strategies: HashMap<String, MergeStrategy> = LIST_SECTIONS
            .iter()
            .map(|key| (key.to_string(), MergeStrategy::ListAppend))
            .collect();
        strategies.insert("package_update".into(), MergeStrategy::ScalarOverride);

        Self {
            strategies,
            fallback: MergeStrategy::ScalarOverride,
        }
    }
}

impl CloudInitMerger {
    pub fn with_strategy(mut self, key: impl Into<String>, strategy: MergeStrategy) -> Self {
        self.strategies.insert(key.into(), strategy);
        self
    }

    /// Strategy for keys absent from the table.
    pub fn with_fallback(mut self, strategy: MergeStrategy) -> Self {
        self.fallback = strategy;
        self
    }

    pub fn strategy(&self, key: &str) -> MergeStrategy {
        self.strategies.get(key).copied().unwrap_or(self.fallback)
    }

    /// Merge fragments in order. Fragment indices in errors are zero-based.
    pub fn merge<S: AsRef<str>>(&self, fragments: &[S]) -> Result<CloudInitDocument> {
        let mut merged = Mapping::new();
        for (index, raw) in fragments.iter().enumerate() {
            let fragment = parse_fragment(index, raw.as_ref())?;
            self.apply(&mut merged, fragment)?;
        }
        Ok(CloudInitDocument(merged))
    }

    fn apply(&self, acc: &mut Mapping, fragment: Mapping) -> Result<()> {
        for (key, value) in fragment {
            let strategy = key
                .as_str()
                .map(|k| self.strategy(k))
                .unwrap_or(self.fallback);

            match strategy {
                MergeStrategy::ListAppend => {
                    if !acc.contains_key(&key) {
                        acc.insert(key.clone(), Value::Sequence(Vec::new()));
                    }
                    match acc.get_mut(&key) {
                        Some(Value::Sequence(section)) => match value {
                            Value::Sequence(entries) => section.extend(entries),
                            other => section.push(other),
                        },
                        _ => {
                            return Err(Error::AccumulatorType {
                                key: key_name(&key),
                            });
                        }
                    }
                }
                MergeStrategy::ScalarOverride => {
                    acc.insert(key, value);
                }
                MergeStrategy::ErrorOnConflict => match acc.get(&key) {
                    Some(existing) if *existing != value => {
                        return Err(Error::ConflictingValue {
                            key: key_name(&key),
                        });
                    }
                    _ => {
                        acc.insert(key, value);
                    }
                },
            }
        }
        Ok(())
    }
}

fn parse_fragment(index: usize, raw: &str) -> Result<Mapping> {
    let value: Value = serde_yaml::from_str(raw).map_err(|e| Error::FragmentParse {
        index,
        reason: e.to_string(),
    })?;

    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        other => Err(Error::FragmentParse {
            index,
            reason: format!("expected a mapping, found {}", value_kind(&other)),
        }),
    }
}

fn key_name(key: &Value) -> String {
    match key.as_str() {
        Some(s) => s.to_string(),
        None => serde_yaml::to_string(key)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| "<unprintable>".into()),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
