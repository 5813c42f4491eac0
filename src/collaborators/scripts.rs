use std::path::{Path, PathBuf};

use anyhow::Context;
use walkdir::WalkDir;

/// Supplies the test scripts handed to the driver
pub trait ScriptSource: Send {
    fn scripts(&mut self) -> anyhow::Result<Vec<PathBuf>>;
}

/// Finds the scripts of one test suite: files named `<prefix>*.<extension>` directly inside
/// `<test_dir>/<suite>`. Paths are absolute and sorted.
#[derive(Debug, Clone)]
pub struct SuiteDirectory {
    pub dir: PathBuf,
    pub prefix: String,
    pub extension: String,
}

impl SuiteDirectory {
    #[must_use]
    pub fn new(test_dir: impl AsRef<Path>, suite: &str, prefix: &str, extension: &str) -> Self {
        Self {
            dir: test_dir.as_ref().join(suite),
            prefix: prefix.to_owned(),
            extension: extension.to_owned(),
        }
    }

    fn matches(&self, path: &Path) -> bool {
        let name_matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&self.prefix));
        let extension_matches = path.extension().is_some_and(|ext| ext == self.extension.as_str());
        name_matches && extension_matches
    }
}

impl ScriptSource for SuiteDirectory {
    fn scripts(&mut self) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self
            .dir
            .canonicalize()
            .with_context(|| format!("test suite directory {} not found", self.dir.display()))?;

        let mut scripts = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("could not list {}", dir.display()))?;
            if entry.file_type().is_file() && self.matches(entry.path()) {
                scripts.push(entry.into_path());
            }
        }
        scripts.sort();

        log::info!("Found the following test files: {scripts:?}");
        Ok(scripts)
    }
}

/// A fixed list of scripts
#[derive(Debug, Clone, Default)]
pub struct FixedScripts(pub Vec<PathBuf>);

impl ScriptSource for FixedScripts {
    fn scripts(&mut self) -> anyhow::Result<Vec<PathBuf>> {
        Ok(self.0.clone())
    }
}

/// Joins script paths into the single space-separated driver argument
#[must_use]
pub fn join_script_list(scripts: &[PathBuf]) -> String {
    scripts.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" ")
}
