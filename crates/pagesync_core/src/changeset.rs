use std::collections::{BTreeMap, HashSet};

use futures::future::try_join_all;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::category::{Category, Classified, classify};
use crate::source::{ContentSource, SourceError};
use crate::transform::indent_block;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// The subset of a push webhook payload this tool reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "ref")]
    pub pushed_ref: String,
    #[serde(default)]
    pub commits: Vec<CommitChanges>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitChanges {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

impl ChangeEvent {
    /// Branch name of a `refs/heads/<branch>` push.
    pub fn branch(&self) -> Option<&str> {
        self.pushed_ref.strip_prefix(BRANCH_REF_PREFIX)
    }

    /// Added and modified paths across all commits, deduplicated, in order
    /// of first appearance.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.commits
            .iter()
            .flat_map(|commit| commit.added.iter().chain(commit.modified.iter()))
            .filter(|path| seen.insert(path.as_str()))
            .cloned()
            .collect()
    }
}

/// One page to replace on the wiki.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncUnit {
    pub category: Category,
    pub title: String,
    /// Source text already indented for the code block.
    pub content: String,
    pub source_path: String,
}

impl SyncUnit {
    pub fn label(&self) -> String {
        format!("{}:{}", self.category, self.title)
    }
}

/// Units for the files touched by a push. An empty result is not an error.
pub async fn build_incremental(
    event: &ChangeEvent,
    source: &dyn ContentSource,
) -> Result<Vec<SyncUnit>, SourceError> {
    let candidates = event
        .changed_paths()
        .into_iter()
        .filter_map(|path| {
            let classified = classify(&path);
            if classified.is_none() {
                debug!(path = %path, "ignoring path outside code/css and code/js");
            }
            classified.map(|classified| (path, classified))
        })
        .collect();
    resolve_units(candidates, source).await
}

/// Units for every file under both category roots.
pub async fn build_full(source: &dyn ContentSource) -> Result<Vec<SyncUnit>, SourceError> {
    let mut candidates = Vec::new();
    for category in Category::ALL {
        let root = category.root_dir();
        for path in source.list_files(&root).await? {
            match classify(&path) {
                Some(classified) if classified.category == category => {
                    candidates.push((path, classified));
                }
                _ => warn!(path = %path, root = %root, "skipping file that is not a {category} page source"),
            }
        }
    }
    resolve_units(candidates, source).await
}

async fn resolve_units(
    candidates: Vec<(String, Classified)>,
    source: &dyn ContentSource,
) -> Result<Vec<SyncUnit>, SourceError> {
    let units = try_join_all(candidates.into_iter().map(|(path, classified)| async move {
        let raw = source.fetch(&path).await?;
        Ok::<_, SourceError>(SyncUnit {
            category: classified.category,
            title: classified.title,
            content: indent_block(&raw),
            source_path: path,
        })
    }))
    .await?;
    warn_on_shared_pages(&units);
    Ok(units)
}

fn warn_on_shared_pages(units: &[SyncUnit]) {
    for (page, paths) in shared_pages(units) {
        warn!(
            page = %page,
            paths = %paths.join(", "),
            "several source files map to the same page; replacements in one batch may interleave and fail"
        );
    }
}

/// Pages targeted by more than one unit, with the source paths involved.
fn shared_pages(units: &[SyncUnit]) -> Vec<(String, Vec<&str>)> {
    let mut by_page: BTreeMap<(Category, &str), Vec<&str>> = BTreeMap::new();
    for unit in units {
        by_page
            .entry((unit.category, unit.title.as_str()))
            .or_default()
            .push(unit.source_path.as_str());
    }
    by_page
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|((category, title), paths)| (format!("{category}:{title}"), paths))
        .collect()
}
