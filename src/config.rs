use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::Deserialize;
use std::{collections::HashSet, fs, path::Path};

use crate::checksums::HashAlgorithm;
use crate::remote::PackageType;

#[derive(Deserialize, Clone)]
pub struct Config {
    pub lists_dir: String,
    #[serde(rename = "repository", default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Deserialize, Clone)]
pub struct RepositoryConfig {
    pub name: String,
    pub method: String,
    pub fallback: Option<String>,
    #[serde(default)]
    pub config: Vec<String>,
    #[serde(rename = "distribution", default)]
    pub distributions: Vec<DistributionConfig>,
}

#[derive(Deserialize, Clone)]
pub struct DistributionConfig {
    pub suite: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default = "default_types")]
    pub types: Vec<String>,
    #[serde(default)]
    pub flat: bool,
    #[serde(default)]
    pub ignore_release: bool,
    pub verify_with: Option<String>,
    #[serde(default)]
    pub ignore_hashes: Vec<String>,
}

fn default_types() -> Vec<String> {
    vec!["deb".to_string()]
}

impl DistributionConfig {
    pub fn package_types(&self) -> Result<Vec<PackageType>> {
        self.types
            .iter()
            .map(|name| {
                PackageType::from_name(name).ok_or_else(|| {
                    anyhow!(
                        "unknown package type '{}' (expected deb, udeb or dsc)",
                        name
                    )
                })
            })
            .collect()
    }

    pub fn ignored_hashes(&self) -> Result<HashSet<HashAlgorithm>> {
        self.ignore_hashes
            .iter()
            .map(|name| {
                HashAlgorithm::from_name(name)
                    .ok_or_else(|| anyhow!("unknown hash algorithm '{}'", name))
            })
            .collect()
    }
}

pub fn lint_config(config: &Config) {
    for repository in &config.repositories {
        if repository.distributions.is_empty() {
            warn!("Repository {} has no distributions.", repository.name);
        }
        for distribution in &repository.distributions {
            if distribution.flat && !distribution.components.is_empty() {
                warn!(
                    "Flat suite {} lists components, they will be ignored.",
                    distribution.suite
                );
            }
            if !distribution.flat && distribution.components.is_empty() {
                warn!(
                    "Suite {} has no components, nothing will be fetched for it.",
                    distribution.suite
                );
            }
            if !distribution.flat
                && distribution.architectures.is_empty()
                && distribution.types.iter().any(|t| t != "dsc")
            {
                warn!(
                    "Suite {} needs architectures for its binary indices.",
                    distribution.suite
                );
            }
        }
    }
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("cannot read '{}'", path.as_ref().display()))?;

    Ok(toml::from_str(&content)?)
}
