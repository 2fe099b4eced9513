//! Layered key/value build properties.
//!
//! A property may be set in several layers at once; lookups return the value
//! from the highest-precedence layer:
//! command line (`--property k=v`) > project (`[properties]`) > environment
//! (`GANTRY_PROP_k`) > registered default.

use std::collections::BTreeMap;
use std::fmt;

/// Environment variable prefix for the environment layer.
pub const ENV_PREFIX: &str = "GANTRY_PROP_";

/// Where a property value came from, ordered by increasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropertySource {
    Default,
    Environment,
    Project,
    CommandLine,
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::Environment => "environment",
            Self::Project => "project",
            Self::CommandLine => "command line",
        })
    }
}

/// Process-wide property store with override precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyStore {
    values: BTreeMap<String, BTreeMap<PropertySource, String>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` in the given layer, replacing any previous value in that layer.
    pub fn set(&mut self, source: PropertySource, key: &str, value: &str) {
        self.values
            .entry(key.to_owned())
            .or_default()
            .insert(source, value.to_owned());
    }

    /// Load the environment layer from `(name, value)` pairs, keeping only
    /// variables that carry the `GANTRY_PROP_` prefix.
    pub fn load_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                if !key.is_empty() {
                    self.set(PropertySource::Environment, key, &value);
                }
            }
        }
    }

    /// The effective value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|layers| layers.values().next_back())
            .map(String::as_str)
    }

    /// The layer that supplied the effective value of `key`.
    pub fn source(&self, key: &str) -> Option<PropertySource> {
        self.values
            .get(key)
            .and_then(|layers| layers.keys().next_back().copied())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Interpret `key` as a flag: absent is `false`; `false`, `0`, `no` and
    /// `off` are `false`; any other value (including empty) is `true`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            )
        })
    }

    /// Split the value of `key` on commas, trimming items and dropping empty ones.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(split_list)
    }
}

/// Split a comma-separated list, trimming items and dropping empty ones.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a `key=value` pair from the command line.
///
/// # Errors
/// Returns an error if there is no `=` or the key is empty.
pub fn parse_property_pair(pair: &str) -> Result<(String, String), PropertyError> {
    let Some((key, value)) = pair.split_once('=') else {
        return Err(PropertyError::MissingSeparator {
            pair: pair.to_owned(),
        });
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(PropertyError::EmptyKey {
            pair: pair.to_owned(),
        });
    }
    Ok((key.to_owned(), value.to_owned()))
}

/// Replace every `${name}` in `template` with `lookup(name)`.
///
/// Unresolved references and unterminated `${` are left untouched.
pub fn interpolate<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let (before, tail) = rest.split_at(start);
        out.push_str(before);
        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };
        let name = tail.get(2..end).unwrap_or_default();
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => out.push_str(tail.get(..=end).unwrap_or_default()),
        }
        rest = tail.get(end + 1..).unwrap_or_default();
    }
    out.push_str(rest);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    #[error("invalid property `{pair}` — expected key=value")]
    MissingSeparator { pair: String },
    #[error("invalid property `{pair}` — key must not be empty")]
    EmptyKey { pair: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn command_line_beats_every_other_layer() {
        let mut store = PropertyStore::new();
        store.set(PropertySource::Default, "jvm", "17");
        store.set(PropertySource::CommandLine, "jvm", "21");
        store.set(PropertySource::Project, "jvm", "11");
        store.set(PropertySource::Environment, "jvm", "8");

        assert_eq!(store.get("jvm"), Some("21"));
        assert_eq!(store.source("jvm"), Some(PropertySource::CommandLine));
    }

    #[test]
    fn project_beats_environment_and_default() {
        let mut store = PropertyStore::new();
        store.set(PropertySource::Default, "release", "false");
        store.load_env([("GANTRY_PROP_release".to_owned(), "maybe".to_owned())]);
        assert_eq!(store.get("release"), Some("maybe"));

        store.set(PropertySource::Project, "release", "true");
        assert_eq!(store.get("release"), Some("true"));
        assert_eq!(store.source("release"), Some(PropertySource::Project));
    }

    #[test]
    fn env_without_prefix_is_ignored() {
        let mut store = PropertyStore::new();
        store.load_env([
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("GANTRY_PROP_".to_owned(), "empty-key".to_owned()),
            ("GANTRY_PROP_skipIntegrationTests".to_owned(), String::new()),
        ]);
        assert!(!store.contains("PATH"));
        assert!(store.contains("skipIntegrationTests"));
        assert!(!store.contains(""));
    }

    #[test]
    fn bool_semantics_follow_presence() {
        let mut store = PropertyStore::new();
        assert!(!store.get_bool("skip"));
        store.set(PropertySource::CommandLine, "skip", "");
        assert!(store.get_bool("skip"));
        store.set(PropertySource::CommandLine, "skip", "off");
        assert!(!store.get_bool("skip"));
    }

    #[test]
    fn list_drops_empty_items() {
        let mut store = PropertyStore::new();
        store.set(PropertySource::Project, "jvms", "11, 21,,");
        assert_eq!(
            store.get_list("jvms").unwrap(),
            vec!["11".to_owned(), "21".to_owned()]
        );
        assert!(store.get_list("missing").is_none());
    }

    #[test]
    fn parse_pair_accepts_equals_in_value() {
        let (k, v) = parse_property_pair("args=-Xmx=1g").unwrap();
        assert_eq!(k, "args");
        assert_eq!(v, "-Xmx=1g");
    }

    #[test]
    fn parse_pair_rejects_malformed() {
        assert!(matches!(
            parse_property_pair("release"),
            Err(PropertyError::MissingSeparator { .. })
        ));
        assert!(matches!(
            parse_property_pair(" =1"),
            Err(PropertyError::EmptyKey { .. })
        ));
    }

    #[test]
    fn interpolate_replaces_known_keys() {
        let out = interpolate("java-${jvm}/${missing}/${", |k| {
            (k == "jvm").then(|| "21".to_owned())
        });
        assert_eq!(out, "java-21/${missing}/${");
    }

    proptest! {
        #[test]
        fn highest_layer_always_wins(
            default in "[a-z]{0,8}",
            project in proptest::option::of("[a-z]{0,8}"),
            cli in proptest::option::of("[a-z]{0,8}"),
        ) {
            let mut store = PropertyStore::new();
            store.set(PropertySource::Default, "k", &default);
            if let Some(p) = &project {
                store.set(PropertySource::Project, "k", p);
            }
            if let Some(c) = &cli {
                store.set(PropertySource::CommandLine, "k", c);
            }
            let expected = cli.or(project).unwrap_or(default);
            prop_assert_eq!(store.get("k"), Some(expected.as_str()));
        }

        #[test]
        fn interpolate_without_references_is_identity(s in "[^$]{0,40}") {
            prop_assert_eq!(interpolate(&s, |_| Some("x".to_owned())), s);
        }
    }
}
