//! Workflow loader - YAML file loading and parsing
//!
//! Resources may live inline in the workflow file or in sibling files listed
//! under `resourceFiles`; the latter are read relative to the workflow file.

use super::types::{Resource, Workflow};
use crate::error::LoadError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Extra top-level key accepted next to the workflow body
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResourceIncludes {
    #[serde(default)]
    resource_files: Vec<String>,
}

/// Loads workflow definitions from YAML files
pub struct WorkflowLoader;

impl WorkflowLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a workflow definition from a YAML file
    pub fn load_workflow<P: AsRef<Path>>(&self, path: P) -> Result<Workflow, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::FileNotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        let mut workflow = Self::parse_yaml(&content)?;

        let includes: ResourceIncludes = serde_yaml::from_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for file in includes.resource_files {
            let resource_path = base.join(&file);
            log::debug!("Loading resources from {}", resource_path.display());
            let text = fs::read_to_string(&resource_path)?;
            workflow.resources.extend(Self::parse_resources(&text)?);
        }

        Ok(workflow)
    }

    /// Parse a workflow definition from a YAML string
    pub fn parse_yaml(content: &str) -> Result<Workflow, LoadError> {
        let workflow: Workflow = serde_yaml::from_str(content)?;
        Ok(workflow)
    }

    /// Parse a resource file holding either one resource or a list
    pub fn parse_resources(content: &str) -> Result<Vec<Resource>, LoadError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            Many(Vec<Resource>),
            One(Box<Resource>),
        }

        let parsed: OneOrMany = serde_yaml::from_str(content)?;
        Ok(match parsed {
            OneOrMany::Many(list) => list,
            OneOrMany::One(resource) => vec![*resource],
        })
    }
}

impl Default for WorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}
