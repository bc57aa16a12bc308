use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::category::CODE_ROOT;
use crate::config::render_default_config;

pub const STATE_DIR_NAME: &str = ".pagesync";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn code_dir(&self) -> PathBuf {
        self.project_root.join(CODE_ROOT)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ncode_dir={} ({})\nconfig_path={} ({}, {})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.code_dir()),
            if self.code_dir().exists() {
                "found"
            } else {
                "missing"
            },
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            if self.config_path.exists() {
                "found"
            } else {
                "missing"
            },
        )
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub(crate) fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("PAGESYNC_CONFIG")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        config_path,
        root_source,
        config_source,
    })
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

/// Create `.pagesync/` and the category roots, and materialize a commented
/// config template unless one exists (or `force` is set).
pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let code_dir = paths.code_dir();
    let required_dirs = [
        paths.state_dir.clone(),
        code_dir.join("css"),
        code_dir.join("js"),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, &render_default_config(), force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = non_empty(lookup_env("PAGESYNC_PROJECT_ROOT")) {
        return (
            absolutize(Path::new(&value), &context.cwd),
            ValueSource::Env,
        );
    }
    detect_project_root_heuristic(&context.cwd)
}

fn detect_project_root_heuristic(cwd: &Path) -> (PathBuf, ValueSource) {
    let mut seen = HashSet::new();
    let mut cursor = Some(cwd);
    while let Some(candidate) = cursor {
        if seen.insert(normalize_for_display(candidate))
            && (candidate.join(CODE_ROOT).is_dir() || candidate.join(STATE_DIR_NAME).is_dir())
        {
            return (candidate.to_path_buf(), ValueSource::Heuristic);
        }
        cursor = candidate.parent();
    }
    (cwd.to_path_buf(), ValueSource::Default)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        PathOverrides, ResolutionContext, ValueSource, init_layout, resolve_paths_with_lookup,
    };

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd: cwd.clone() };
        let env = HashMap::from([(
            "PAGESYNC_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(
            resolved.config_path,
            from_flag.join(".pagesync").join("config.toml")
        );
    }

    #[test]
    fn resolve_paths_detects_root_from_code_dir() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("repo");
        let nested = root.join("code").join("js").join("greet");
        fs::create_dir_all(&nested).expect("create nested");

        let context = ResolutionContext {
            cwd: nested.clone(),
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn resolve_paths_uses_env_config_relative_to_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("repo");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([("PAGESYNC_CONFIG".to_string(), "ci/sync.toml".to_string())]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve");
        assert_eq!(resolved.config_path, root.join("ci").join("sync.toml"));
        assert_eq!(resolved.config_source, ValueSource::Env);
    }

    #[test]
    fn init_layout_creates_dirs_and_keeps_existing_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, false).expect("init");
        assert!(report.wrote_config);
        assert_eq!(report.created_dirs.len(), 3);
        assert!(root.join("code").join("css").is_dir());
        assert!(root.join("code").join("js").is_dir());
        assert!(paths.config_path.exists());

        fs::write(&paths.config_path, "[wiki]\nproject = \"kept\"\n").expect("overwrite");
        let again = init_layout(&paths, false).expect("init again");
        assert!(!again.wrote_config);
        assert!(again.created_dirs.is_empty());
        let content = fs::read_to_string(&paths.config_path).expect("read");
        assert!(content.contains("kept"));
    }
}
