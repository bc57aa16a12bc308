use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::category::Category;
use crate::changeset::SyncUnit;

pub const EDIT_MENU_SELECTOR: &str = "#page-edit-menu";
pub const COPY_LINK_SELECTOR: &str = "#app-container div.dropdown.open ul > li:nth-child(1) > a";
pub const DELETE_BUTTON_SELECTOR: &str =
    "#app-container div.dropdown.open ul > li > a[title=\"Delete\"]";

/// Browser primitives the protocol needs from one tab.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    /// Resolve once `selector` matches an element, or fail after the
    /// automation timeout.
    async fn wait_for_selector(&self, selector: &str) -> Result<()>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn exists(&self, selector: &str) -> Result<bool>;

    async fn wait_for_navigation(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// An authenticated browser session that hands out independent tabs.
///
/// Every page handed out already auto-accepts dialogs and shares the
/// session's authentication cookie.
#[async_trait]
pub trait WikiSession: Send + Sync {
    type Page: PageHandle;

    async fn open_page(&self) -> Result<Self::Page>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait SessionLauncher: Send + Sync {
    type Session: WikiSession;

    async fn launch(&self) -> Result<Self::Session>;
}

/// Base URL and project of the target wiki.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLocation {
    base_url: String,
    project: String,
}

impl WikiLocation {
    pub fn new(base_url: &str, project: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn page_url(&self, title: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            urlencoding::encode(&self.project),
            urlencoding::encode(title)
        )
    }

    pub fn create_url(&self, title: &str, body: &str) -> String {
        format!("{}?body={}", self.page_url(title), urlencoding::encode(body))
    }
}

/// Per-category page header: tag marker plus optional eye-catch image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTemplate {
    pub tag: String,
    pub eyecatch_url: Option<String>,
}

impl PageTemplate {
    pub fn new(tag: impl Into<String>, eyecatch_url: Option<String>) -> Self {
        Self {
            tag: tag.into(),
            eyecatch_url,
        }
    }

    /// Page body for an already indented code block.
    pub fn render_body(&self, category: Category, indented: &str) -> String {
        let mut body = format!("\n{}\n\n", self.tag);
        if let Some(url) = &self.eyecatch_url {
            body.push_str(&format!("[{url}]\n\n"));
        }
        body.push_str(&format!(
            "code:{}\n{indented}\n\n",
            category.canonical_filename()
        ));
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStep {
    NavigateToTarget,
    OpenEditMenu,
    DeleteIfPresent,
    NavigateToCreate,
    Done,
}

impl fmt::Display for ProtocolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NavigateToTarget => "navigate to page",
            Self::OpenEditMenu => "open edit menu",
            Self::DeleteIfPresent => "delete existing page",
            Self::NavigateToCreate => "create page",
            Self::Done => "done",
        })
    }
}

/// Replace the page for `unit` with its current content.
///
/// The wiki has no write API, so this drives its UI: open the page, open the
/// edit menu, delete the page if it exists, then navigate to the creation URL
/// with the new body as a query parameter.
///
/// Not transactional: a failure after the delete step leaves the page
/// deleted. There is no retry; the first failing step is returned.
pub async fn replace_page<P>(
    page: &P,
    wiki: &WikiLocation,
    template: &PageTemplate,
    unit: &SyncUnit,
) -> Result<()>
where
    P: PageHandle + ?Sized,
{
    let page_url = wiki.page_url(&unit.title);
    let mut step = ProtocolStep::NavigateToTarget;
    while step != ProtocolStep::Done {
        debug!(page = %unit.label(), %step, "protocol step");
        let next = run_step(page, step, wiki, template, unit, &page_url)
            .await
            .with_context(|| format!("{step} failed for {}", unit.label()))?;
        step = next;
    }
    Ok(())
}

async fn run_step<P>(
    page: &P,
    step: ProtocolStep,
    wiki: &WikiLocation,
    template: &PageTemplate,
    unit: &SyncUnit,
    page_url: &str,
) -> Result<ProtocolStep>
where
    P: PageHandle + ?Sized,
{
    match step {
        ProtocolStep::NavigateToTarget => {
            tokio::try_join!(
                page.wait_for_selector(EDIT_MENU_SELECTOR),
                page.goto(page_url)
            )?;
            Ok(ProtocolStep::OpenEditMenu)
        }
        ProtocolStep::OpenEditMenu => {
            let populated = format!("{DELETE_BUTTON_SELECTOR}, {COPY_LINK_SELECTOR}");
            tokio::try_join!(
                page.wait_for_selector(&populated),
                page.click(EDIT_MENU_SELECTOR)
            )?;
            Ok(ProtocolStep::DeleteIfPresent)
        }
        ProtocolStep::DeleteIfPresent => {
            if page.exists(DELETE_BUTTON_SELECTOR).await? {
                tokio::try_join!(
                    page.wait_for_navigation(),
                    page.click(DELETE_BUTTON_SELECTOR)
                )?;
            } else {
                debug!(page = %unit.label(), "page does not exist yet; nothing to delete");
            }
            Ok(ProtocolStep::NavigateToCreate)
        }
        ProtocolStep::NavigateToCreate => {
            let body = template.render_body(unit.category, &unit.content);
            let create_url = wiki.create_url(&unit.title, &body);
            tokio::try_join!(
                page.wait_for_selector(EDIT_MENU_SELECTOR),
                page.goto(&create_url)
            )?;
            Ok(ProtocolStep::Done)
        }
        ProtocolStep::Done => Ok(ProtocolStep::Done),
    }
}
