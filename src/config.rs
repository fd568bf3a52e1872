use crate::docker::DockerBuildOpts;
use crate::errors::*;
use crate::resources::Resource;
use crate::search::{default_search_rules, SearchRule};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "kbld.k14s.io/v1alpha1";
pub const KIND: &str = "Config";

const API_GROUP_PREFIX: &str = "kbld.k14s.io/";

/// One kbld configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_required_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_rules: Vec<SearchRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<ImageOverride>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<ImageDestination>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    pub image: String,
    pub new_image: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub preresolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_selection: Option<TagSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSelection {
    pub semver: SemverSelection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemverSelection {
    pub constraints: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub image: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<SourceDockerOpts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDockerOpts {
    #[serde(default)]
    pub build: DockerBuildOpts,
}

impl Source {
    pub fn docker_build_opts(&self) -> DockerBuildOpts {
        self.docker
            .as_ref()
            .map(|docker| docker.build.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDestination {
    pub image: String,
    pub new_image: String,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Config {
    pub fn empty() -> Config {
        Config {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            minimum_required_version: None,
            search_rules: Vec::new(),
            overrides: Vec::new(),
            sources: Vec::new(),
            destinations: Vec::new(),
        }
    }

    pub fn from_resource(resource: &Resource) -> Result<Config> {
        let config = serde_yaml::from_value::<Config>(resource.value().clone())
            .context("Failed to parse kbld config document")?;
        config.validate_version()?;
        Ok(config)
    }

    /// Builds configuration from an image-map file, a json object mapping
    /// unresolved to resolved references. Every entry becomes a pre-resolved
    /// override.
    pub fn from_image_map(buf: &[u8]) -> Result<Config> {
        let mapping = serde_json::from_slice::<IndexMap<String, String>>(buf)
            .context("Failed to parse image map file as a json object")?;

        let mut config = Config::empty();
        for (image, new_image) in mapping {
            config.overrides.push(ImageOverride {
                image,
                new_image,
                preresolved: true,
                tag_selection: None,
            });
        }
        Ok(config)
    }

    fn validate_version(&self) -> Result<()> {
        let Some(min) = &self.minimum_required_version else {
            return Ok(());
        };
        let min = semver::Version::parse(min)
            .with_context(|| anyhow!("Failed to parse minimumRequiredVersion: {min:?}"))?;
        let current = semver::Version::parse(env!("CARGO_PKG_VERSION"))
            .context("Failed to parse crate version")?;
        if current < min {
            bail!("Config requires kbld version >= {min}, this is {current}");
        }
        Ok(())
    }
}

/// All configuration documents seen in the input, in order.
#[derive(Debug, Clone, Default)]
pub struct Conf {
    configs: Vec<Config>,
}

impl Conf {
    /// Splits the input stream into non-config resources and aggregated
    /// configuration, matching documents by kind.
    pub fn from_resources(resources: Vec<Resource>) -> Result<(Vec<Resource>, Conf)> {
        let mut non_config = Vec::new();
        let mut conf = Conf::default();

        for resource in resources {
            let is_config = resource
                .api_version()
                .is_some_and(|v| v.starts_with(API_GROUP_PREFIX))
                && resource.kind() == Some(KIND);
            if is_config {
                conf.configs.push(Config::from_resource(&resource)?);
            } else {
                non_config.push(resource);
            }
        }

        Ok((non_config, conf))
    }

    pub fn with_additional(mut self, config: Config) -> Conf {
        self.configs.push(config);
        self
    }

    /// Later configuration wins when several name the same image, so
    /// image-map entries ingested last take precedence.
    pub fn override_for(&self, url: &str) -> Option<&ImageOverride> {
        self.configs
            .iter()
            .flat_map(|c| &c.overrides)
            .filter(|o| o.image == url)
            .last()
    }

    pub fn source_for(&self, url: &str) -> Option<&Source> {
        self.configs
            .iter()
            .flat_map(|c| &c.sources)
            .filter(|s| s.image == url)
            .last()
    }

    pub fn destination_for(&self, url: &str) -> Option<&ImageDestination> {
        self.configs
            .iter()
            .flat_map(|c| &c.destinations)
            .filter(|d| d.image == url)
            .last()
    }

    /// User rules first, defaults appended.
    pub fn search_rules(&self) -> Vec<SearchRule> {
        let mut rules = self.search_rules_without_defaults();
        rules.extend(default_search_rules());
        rules
    }

    pub fn search_rules_without_defaults(&self) -> Vec<SearchRule> {
        self.configs
            .iter()
            .flat_map(|c| c.search_rules.iter().cloned())
            .collect()
    }
}
