#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

mod recipe;
mod store_path;

use std::path::PathBuf;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("std io error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("recipe parse error: `{0}`")]
    Parse(#[from] serde_json::Error),
}

pub use recipe::{Output as RecipeOutput, Recipe};
pub use store_path::StorePath;

/// Limits handed to the remote build protocol. Enforced by the builder, not
/// by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    max_silent_time: i32,
    build_timeout: i32,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildOptions {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_silent_time: 3600,
            build_timeout: 36000,
        }
    }

    pub const fn set_max_silent_time(&mut self, v: i32) {
        self.max_silent_time = v;
    }

    pub const fn set_build_timeout(&mut self, v: i32) {
        self.build_timeout = v;
    }

    #[must_use]
    pub const fn get_max_silent_time(&self) -> i32 {
        self.max_silent_time
    }

    #[must_use]
    pub const fn get_build_timeout(&self) -> i32 {
        self.build_timeout
    }
}

/// A store rooted at a local directory. Paths are valid when they exist
/// below the root; recipes are JSON documents.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: Arc<PathBuf>,
}

impl LocalStore {
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    #[must_use]
    pub fn print_store_path(&self, path: &StorePath) -> String {
        self.root.join(path.base_name()).display().to_string()
    }

    pub async fn is_valid_path(&self, path: &StorePath) -> bool {
        fs_err::tokio::metadata(self.root.join(path.base_name()))
            .await
            .is_ok()
    }

    #[tracing::instrument(skip(self), fields(%path), err)]
    pub async fn query_recipe(&self, path: &StorePath) -> Result<Option<Recipe>, Error> {
        let full = self.root.join(path.base_name());
        let content = match fs_err::tokio::read_to_string(&full).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Recipe::parse(&content)?))
    }

    /// Outputs of `recipe` that are not yet present in the store. Outputs
    /// without a known path count as missing since only a build can name them.
    pub async fn missing_outputs(&self, recipe: &Recipe) -> Vec<RecipeOutput> {
        let mut missing = Vec::new();
        for o in &recipe.outputs {
            let realized = match &o.path {
                Some(p) => self.is_valid_path(p).await,
                None => false,
            };
            if !realized {
                missing.push(o.clone());
            }
        }
        missing
    }

    pub async fn output_size(&self, path: &StorePath) -> u64 {
        (fs_err::tokio::metadata(self.root.join(path.base_name())).await)
            .map(|m| m.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_store_file(dir: &std::path::Path, base_name: &str, content: &str) {
        fs_err::write(dir.join(base_name), content).unwrap();
    }

    #[tokio::test]
    async fn test_query_recipe_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path());
        let path = StorePath::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-missing.recipe");
        assert!(store.query_recipe(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_recipe_parses() {
        let dir = tempfile::tempdir().unwrap();
        write_store_file(
            dir.path(),
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg.recipe",
            r#"{"platform": "x86_64-linux", "outputs": {"out": "cccccccccccccccccccccccccccccccc-pkg"}}"#,
        );
        let store = LocalStore::open(dir.path());
        let path = StorePath::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg.recipe");
        let recipe = store.query_recipe(&path).await.unwrap().unwrap();
        assert_eq!(recipe.platform, "x86_64-linux");
    }

    #[tokio::test]
    async fn test_missing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        write_store_file(dir.path(), "cccccccccccccccccccccccccccccccc-present", "");
        let store = LocalStore::open(dir.path());
        let recipe = Recipe::parse(
            r#"{
                "platform": "x86_64-linux",
                "outputs": {
                    "out": "cccccccccccccccccccccccccccccccc-present",
                    "dev": "dddddddddddddddddddddddddddddddd-absent"
                }
            }"#,
        )
        .unwrap();

        let missing = store.missing_outputs(&recipe).await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "dev");
    }
}
