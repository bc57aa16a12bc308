use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use crate::category::Category;
use crate::changeset::SyncUnit;
use crate::config::{Settings, SettingsOverrides, SyncConfig, resolve_settings_with_lookup};
use crate::protocol::{
    COPY_LINK_SELECTOR, DELETE_BUTTON_SELECTOR, EDIT_MENU_SELECTOR, PageHandle, SessionLauncher,
    WikiSession,
};
use crate::runtime::{ResolvedPaths, ValueSource};
use crate::source::{ContentSource, SourceError};

const WAIT_POLLS: usize = 1_000;

/// Settings resolved from defaults plus the given environment only.
pub(crate) fn settings(env: &[(&str, &str)]) -> Settings {
    let env: HashMap<String, String> = env
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    let root = Path::new("/repo");
    let paths = ResolvedPaths {
        project_root: root.to_path_buf(),
        state_dir: root.join(".pagesync"),
        config_path: root.join(".pagesync").join("config.toml"),
        root_source: ValueSource::Flag,
        config_source: ValueSource::Default,
    };
    resolve_settings_with_lookup(
        &SyncConfig::default(),
        &paths,
        SettingsOverrides::default(),
        |key| env.get(key).cloned(),
    )
    .expect("resolve test settings")
}

pub(crate) fn unit(category: Category, title: &str, content: &str) -> SyncUnit {
    SyncUnit {
        category,
        title: title.to_string(),
        content: content.to_string(),
        source_path: format!("{}/{title}/{}", category.root_dir(), category.canonical_filename()),
    }
}

/// In-memory repository contents keyed by repository-relative path.
#[derive(Debug, Default)]
pub(crate) struct MemorySource {
    files: BTreeMap<String, String>,
    fetches: AtomicUsize,
    branches: BTreeMap<String, BTreeMap<String, String>>,
}

impl MemorySource {
    pub(crate) fn new<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
            fetches: AtomicUsize::new(0),
            branches: BTreeMap::new(),
        }
    }

    /// Contents served when the source is read at `branch`.
    pub(crate) fn with_branch<'a>(
        mut self,
        branch: &str,
        files: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let files = files
            .into_iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        self.branches.insert(branch.to_string(), files);
        self
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    fn label(&self) -> String {
        "memory".to_string()
    }

    async fn fetch(&self, path: &str) -> Result<String, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(path.to_string()))
    }

    async fn list_files(&self, root: &str) -> Result<Vec<String>, SourceError> {
        let prefix = format!("{}/", root.trim_end_matches('/'));
        Ok(self
            .files
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn at_branch(&self, branch: &str) -> Option<Box<dyn ContentSource>> {
        let files = self.branches.get(branch)?;
        Some(Box::new(MemorySource {
            files: files.clone(),
            ..MemorySource::default()
        }))
    }
}

#[derive(Debug, Default)]
struct WikiState {
    pages: BTreeMap<String, String>,
    actions: Vec<String>,
    failing_titles: HashSet<String>,
    fail_launch: bool,
    launches: usize,
    sessions_closed: usize,
    open_pages: usize,
    max_open_pages: usize,
    pages_closed: usize,
}

/// Scripted stand-in for the wiki UI, shared by every fake page and session.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeWiki {
    state: Arc<Mutex<WikiState>>,
}

impl FakeWiki {
    pub(crate) fn with_pages<'a>(titles: impl IntoIterator<Item = &'a str>) -> Self {
        let wiki = Self::default();
        {
            let mut state = wiki.lock();
            for title in titles {
                state.pages.insert(title.to_string(), String::new());
            }
        }
        wiki
    }

    fn lock(&self) -> MutexGuard<'_, WikiState> {
        self.state.lock().expect("fake wiki state")
    }

    pub(crate) fn page(&self) -> FakePage {
        FakePage {
            wiki: self.clone(),
            view: Arc::new(Mutex::new(PageView::default())),
        }
    }

    pub(crate) fn launcher(&self) -> FakeLauncher {
        FakeLauncher { wiki: self.clone() }
    }

    pub(crate) fn fail_navigation_for(&self, title: &str) {
        self.lock().failing_titles.insert(title.to_string());
    }

    pub(crate) fn fail_launch(&self) {
        self.lock().fail_launch = true;
    }

    pub(crate) fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    pub(crate) fn body_of(&self, title: &str) -> Option<String> {
        self.lock().pages.get(title).cloned()
    }

    pub(crate) fn launches(&self) -> usize {
        self.lock().launches
    }

    pub(crate) fn sessions_closed(&self) -> usize {
        self.lock().sessions_closed
    }

    pub(crate) fn max_open_pages(&self) -> usize {
        self.lock().max_open_pages
    }

    pub(crate) fn pages_closed(&self) -> usize {
        self.lock().pages_closed
    }
}

#[derive(Debug, Default)]
struct PageView {
    title: Option<String>,
    menu_open: bool,
    navigations: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct FakePage {
    wiki: FakeWiki,
    view: Arc<Mutex<PageView>>,
}

impl FakePage {
    fn view(&self) -> MutexGuard<'_, PageView> {
        self.view.lock().expect("fake page view")
    }

    fn matches(&self, selector: &str) -> bool {
        let view = self.view();
        let Some(title) = view.title.as_deref() else {
            return false;
        };
        let page_exists = self.wiki.lock().pages.contains_key(title);
        if selector == EDIT_MENU_SELECTOR {
            return true;
        }
        if !view.menu_open {
            return false;
        }
        selector.split(',').map(str::trim).any(|part| match part {
            DELETE_BUTTON_SELECTOR => page_exists,
            COPY_LINK_SELECTOR => true,
            _ => false,
        })
    }

    fn navigations(&self) -> usize {
        self.view().navigations
    }
}

fn parse_wiki_url(url: &str) -> Result<(String, Option<String>)> {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };
    let encoded_title = path
        .rsplit('/')
        .next()
        .ok_or_else(|| anyhow!("url without title: {url}"))?;
    let title = urlencoding::decode(encoded_title)?.into_owned();
    let body = match query.and_then(|query| query.strip_prefix("body=")) {
        Some(encoded) => Some(urlencoding::decode(encoded)?.into_owned()),
        None => None,
    };
    Ok((title, body))
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, url: &str) -> Result<()> {
        let (title, body) = parse_wiki_url(url)?;
        {
            let mut state = self.wiki.lock();
            if state.failing_titles.contains(&title) {
                bail!("net::ERR_CONNECTION_RESET at {url}");
            }
            match body {
                Some(body) => {
                    state.actions.push(format!("create {title}"));
                    state.pages.insert(title.clone(), body);
                }
                None => state.actions.push(format!("goto {title}")),
            }
        }
        let mut view = self.view();
        view.title = Some(title);
        view.menu_open = false;
        view.navigations += 1;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str) -> Result<()> {
        for _ in 0..WAIT_POLLS {
            if self.matches(selector) {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        bail!("timed out waiting for selector {selector}")
    }

    async fn click(&self, selector: &str) -> Result<()> {
        if !self.matches(selector) {
            bail!("no element matches {selector}");
        }
        let mut view = self.view();
        let title = view.title.clone().unwrap_or_default();
        if selector == EDIT_MENU_SELECTOR {
            view.menu_open = true;
            self.wiki
                .lock()
                .actions
                .push(format!("click {EDIT_MENU_SELECTOR}"));
        } else if selector == DELETE_BUTTON_SELECTOR {
            let mut state = self.wiki.lock();
            state.pages.remove(&title);
            state.actions.push(format!("delete {title}"));
            view.menu_open = false;
            view.navigations += 1;
        }
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        Ok(self.matches(selector))
    }

    async fn wait_for_navigation(&self) -> Result<()> {
        let before = self.navigations();
        for _ in 0..WAIT_POLLS {
            tokio::task::yield_now().await;
            if self.navigations() != before {
                return Ok(());
            }
        }
        bail!("timed out waiting for navigation")
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.wiki.lock();
        state.open_pages = state.open_pages.saturating_sub(1);
        state.pages_closed += 1;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeSession {
    wiki: FakeWiki,
}

#[async_trait]
impl WikiSession for FakeSession {
    type Page = FakePage;

    async fn open_page(&self) -> Result<FakePage> {
        {
            let mut state = self.wiki.lock();
            state.open_pages += 1;
            state.max_open_pages = state.max_open_pages.max(state.open_pages);
        }
        Ok(self.wiki.page())
    }

    async fn close(&mut self) -> Result<()> {
        self.wiki.lock().sessions_closed += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeLauncher {
    wiki: FakeWiki,
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    type Session = FakeSession;

    async fn launch(&self) -> Result<FakeSession> {
        let mut state = self.wiki.lock();
        if state.fail_launch {
            bail!("failed to launch browser: no chrome executable found");
        }
        state.launches += 1;
        Ok(FakeSession {
            wiki: self.wiki.clone(),
        })
    }
}
