//! Named host groups, loaded from a YAML mapping of `group -> [hosts]`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct HostGroups {
    groups: BTreeMap<String, Vec<String>>,
}

impl HostGroups {
    pub const DEFAULT_PATH: &'static str = "/etc/drover/groups.yaml";

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read host group config '{}'", path.display()))?;
        let groups: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("while parsing '{}'", path.display()))?;
        Ok(groups)
    }

    /// A missing config file behaves as "no groups defined"; a present but
    /// malformed one is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_map(map: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        Self {
            groups: map.into_iter().collect(),
        }
    }

    /// Hosts in the named group; unknown groups resolve to the empty list.
    pub fn resolve_group(&self, name: &str) -> &[String] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Groups in sorted order, for listing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.groups
            .iter()
            .map(|(name, hosts)| (name.as_str(), hosts.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
