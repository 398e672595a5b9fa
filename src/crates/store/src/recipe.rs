use std::collections::HashMap;

use smallvec::SmallVec;

use crate::StorePath;

#[derive(Debug, Clone)]
pub struct Output {
    pub name: String,
    pub path: Option<StorePath>,
}

/// On-disk representation of a recipe. Outputs map a symbolic name to the
/// store path the build is expected to produce; a missing path means the
/// output is content-addressed and only known after the build.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipeFile {
    platform: String,
    #[serde(default)]
    inputs: Vec<StorePath>,
    outputs: HashMap<String, Option<String>>,
    #[serde(default)]
    required_features: Vec<String>,
    #[serde(default)]
    prefer_local: bool,
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub platform: String,
    pub inputs: SmallVec<[StorePath; 8]>,
    pub outputs: SmallVec<[Output; 6]>,
    pub required_features: SmallVec<[String; 4]>,
    pub prefer_local: bool,
}

impl Recipe {
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let file: RecipeFile = serde_json::from_str(content)?;
        let mut outputs: SmallVec<[Output; 6]> = file
            .outputs
            .into_iter()
            .map(|(name, path)| Output {
                name,
                path: path.as_deref().map(StorePath::new),
            })
            .collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            platform: file.platform,
            inputs: file.inputs.into(),
            outputs,
            required_features: file.required_features.into(),
            prefer_local: file.prefer_local,
        })
    }

    /// Platform plus required features, e.g. `x86_64-linux:big-parallel,kvm`.
    /// Steps with the same system type are interchangeable between machines.
    #[must_use]
    pub fn system_type(&self) -> String {
        if self.required_features.is_empty() {
            return self.platform.clone();
        }
        let mut features = self.required_features.to_vec();
        features.sort();
        format!("{}:{}", self.platform, features.join(","))
    }

    #[must_use]
    pub fn output_paths(&self) -> Vec<StorePath> {
        self.outputs.iter().filter_map(|o| o.path.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"{
        "platform": "x86_64-linux",
        "inputs": ["bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep.recipe"],
        "outputs": {"out": "cccccccccccccccccccccccccccccccc-pkg"},
        "requiredFeatures": ["kvm", "big-parallel"],
        "preferLocal": false
    }"#;

    #[test]
    fn test_parse_recipe() {
        let recipe = Recipe::parse(RECIPE).unwrap();
        assert_eq!(recipe.platform, "x86_64-linux");
        assert_eq!(recipe.inputs.len(), 1);
        assert_eq!(recipe.outputs.len(), 1);
        assert_eq!(recipe.outputs[0].name, "out");
        assert!(!recipe.prefer_local);
    }

    #[test]
    fn test_parse_recipe_defaults() {
        let recipe =
            Recipe::parse(r#"{"platform": "aarch64-linux", "outputs": {"out": null}}"#).unwrap();
        assert!(recipe.inputs.is_empty());
        assert!(recipe.required_features.is_empty());
        assert!(recipe.outputs[0].path.is_none());
    }

    #[test]
    fn test_parse_recipe_rejects_garbage() {
        assert!(Recipe::parse("not json").is_err());
        assert!(Recipe::parse(r#"{"platform": "x86_64-linux"}"#).is_err());
    }

    #[test]
    fn test_system_type_sorts_features() {
        let recipe = Recipe::parse(RECIPE).unwrap();
        assert_eq!(recipe.system_type(), "x86_64-linux:big-parallel,kvm");

        let plain =
            Recipe::parse(r#"{"platform": "x86_64-linux", "outputs": {"out": null}}"#).unwrap();
        assert_eq!(plain.system_type(), "x86_64-linux");
    }
}
