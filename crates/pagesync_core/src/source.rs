use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::{GitHubSettings, Secret, SourceSettings};

const USER_AGENT: &str = concat!("pagesync/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source file not found: {0}")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("request for {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request for {path} returned HTTP {status}")]
    Status { path: String, status: StatusCode },

    #[error("invalid source path: {0}")]
    InvalidPath(String),
}

/// Where the raw text of a source file comes from.
///
/// Paths are repository-relative with `/` separators (as they appear in a
/// push payload).
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn label(&self) -> String;

    async fn fetch(&self, path: &str) -> Result<String, SourceError>;

    /// All files below `root`, recursively, as repository-relative paths.
    async fn list_files(&self, root: &str) -> Result<Vec<String>, SourceError>;

    /// The same repository read at `branch`. `None` when the source has no
    /// notion of refs and always serves one tree.
    fn at_branch(&self, _branch: &str) -> Option<Box<dyn ContentSource>> {
        None
    }
}

pub fn source_from_settings(
    settings: &SourceSettings,
) -> Result<Box<dyn ContentSource>, SourceError> {
    match settings {
        SourceSettings::Local { root } => Ok(Box::new(LocalSource::new(root.clone()))),
        SourceSettings::GitHub(github) => Ok(Box::new(GitHubSource::new(github.clone())?)),
    }
}

#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if path.trim().is_empty() || escapes {
            return Err(SourceError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContentSource for LocalSource {
    fn label(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn fetch(&self, path: &str) -> Result<String, SourceError> {
        let absolute = self.resolve(path)?;
        match tokio::fs::read_to_string(&absolute).await {
            Ok(content) => Ok(content),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(SourceError::NotFound(path.to_string()))
            }
            Err(source) => Err(SourceError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn list_files(&self, root: &str) -> Result<Vec<String>, SourceError> {
        let base = self.resolve(root)?;
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|error| SourceError::Io {
                path: root.to_string(),
                source: error.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| SourceError::InvalidPath(entry.path().display().to_string()))?;
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
        Ok(files)
    }
}

/// Reads files from a GitHub repository at one ref.
#[derive(Debug, Clone)]
pub struct GitHubSource {
    client: Client,
    settings: GitHubSettings,
}

impl GitHubSource {
    pub fn new(settings: GitHubSettings) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| SourceError::Transport {
                path: settings.repository.clone(),
                source,
            })?;
        Ok(Self { client, settings })
    }

    pub fn at_ref(&self, git_ref: &str) -> Self {
        let mut settings = self.settings.clone();
        settings.git_ref = git_ref.to_string();
        Self {
            client: self.client.clone(),
            settings,
        }
    }

    pub fn raw_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.settings.raw_base.trim_end_matches('/'),
            self.settings.repository,
            encode_path(&self.settings.git_ref),
            encode_path(path)
        )
    }

    pub fn tree_url(&self) -> String {
        format!(
            "{}/repos/{}/git/trees/{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.repository,
            urlencoding::encode(&self.settings.git_ref)
        )
    }
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[async_trait]
impl ContentSource for GitHubSource {
    fn label(&self) -> String {
        format!("github:{}@{}", self.settings.repository, self.settings.git_ref)
    }

    async fn fetch(&self, path: &str) -> Result<String, SourceError> {
        let request = authorize(
            self.client.get(self.raw_url(path)),
            self.settings.token.as_ref(),
        );
        let response = request
            .send()
            .await
            .map_err(|source| SourceError::Transport {
                path: path.to_string(),
                source,
            })?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(SourceError::NotFound(path.to_string())),
            status if !status.is_success() => {
                return Err(SourceError::Status {
                    path: path.to_string(),
                    status,
                });
            }
            _ => {}
        }
        response
            .text()
            .await
            .map_err(|source| SourceError::Transport {
                path: path.to_string(),
                source,
            })
    }

    fn at_branch(&self, branch: &str) -> Option<Box<dyn ContentSource>> {
        Some(Box::new(self.at_ref(branch)))
    }

    async fn list_files(&self, root: &str) -> Result<Vec<String>, SourceError> {
        let request = authorize(
            self.client
                .get(self.tree_url())
                .header("Accept", "application/vnd.github+json")
                .query(&[("recursive", "1")]),
            self.settings.token.as_ref(),
        );
        let response = request
            .send()
            .await
            .map_err(|source| SourceError::Transport {
                path: root.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                path: root.to_string(),
                status,
            });
        }
        let payload: TreeResponse =
            response
                .json()
                .await
                .map_err(|source| SourceError::Transport {
                    path: root.to_string(),
                    source,
                })?;
        if payload.truncated {
            tracing::warn!(
                repository = %self.settings.repository,
                "git tree listing was truncated; some files may be missing"
            );
        }
        Ok(filter_tree(payload.tree, root))
    }
}

fn filter_tree(entries: Vec<TreeEntry>, root: &str) -> Vec<String> {
    let prefix = format!("{}/", root.trim_end_matches('/'));
    let mut files: Vec<String> = entries
        .into_iter()
        .filter(|entry| entry.kind == "blob" && entry.path.starts_with(&prefix))
        .map(|entry| entry.path)
        .collect();
    files.sort();
    files
}

fn authorize(request: RequestBuilder, token: Option<&Secret>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token.expose()),
        None => request,
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
