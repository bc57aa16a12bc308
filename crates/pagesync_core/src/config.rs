use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::protocol::{PageTemplate, WikiLocation};
use crate::runtime::{ResolvedPaths, normalize_for_display};

pub const DEFAULT_WIKI_BASE_URL: &str = "https://scrapbox.io";
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "connect.sid";
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_BROWSER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GIT_REF: &str = "main";
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_RAW_BASE: &str = "https://raw.githubusercontent.com";
pub const DEFAULT_TARGET_BRANCHES: [&str; 2] = ["main", "master"];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub templates: TemplatesSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub source: SourceSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub base_url: Option<String>,
    pub project: Option<String>,
    pub session_cookie_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WebhookSection {
    pub target_branches: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub batch_size: Option<usize>,
    pub local: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TemplatesSection {
    #[serde(default)]
    pub style: TemplateSection,
    #[serde(default)]
    pub script: TemplateSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TemplateSection {
    pub tag: Option<String>,
    pub eyecatch_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BrowserSection {
    pub headless: Option<bool>,
    pub executable: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub no_sandbox: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Local,
    Github,
}

impl SourceKind {
    pub fn parse(value: &str) -> Result<Self> {
        if value.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }
        if value.eq_ignore_ascii_case("github") {
            return Ok(Self::Github);
        }
        bail!("unsupported source kind: {value} (expected local|github)")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub kind: Option<SourceKind>,
    pub root: Option<PathBuf>,
    pub repository: Option<String>,
    pub git_ref: Option<String>,
    pub api_base: Option<String>,
    pub raw_base: Option<String>,
}

/// Load and parse a SyncConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<SyncConfig> {
    if !config_path.exists() {
        return Ok(SyncConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: SyncConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// A credential that never shows up in `Debug` output or diagnostics.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub wiki: WikiSettings,
    pub webhook: WebhookSettings,
    pub batch_size: NonZeroUsize,
    pub local_mode: bool,
    pub templates: TemplateSet,
    pub browser: BrowserSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct WikiSettings {
    pub base_url: String,
    pub project: Option<String>,
    pub session_cookie_name: String,
    pub session_cookie: Option<Secret>,
}

impl WikiSettings {
    pub fn location(&self) -> Result<WikiLocation> {
        let project = self
            .project
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wiki project is not configured (set WIKI_PROJECT)"))?;
        Ok(WikiLocation::new(&self.base_url, project))
    }

    pub fn require_session_cookie(&self) -> Result<&Secret> {
        self.session_cookie
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("wiki session cookie is not configured (set WIKI_SESSION_SID)"))
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: Option<Secret>,
    pub target_branches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSet {
    pub style: PageTemplate,
    pub script: PageTemplate,
}

impl TemplateSet {
    pub fn for_category(&self, category: Category) -> &PageTemplate {
        match category {
            Category::Style => &self.style,
            Category::Script => &self.script,
        }
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            style: PageTemplate::new(Category::Style.default_tag(), None),
            script: PageTemplate::new(Category::Script.default_tag(), None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserSettings {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub timeout: Duration,
    pub no_sandbox: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            timeout: Duration::from_secs(DEFAULT_BROWSER_TIMEOUT_SECS),
            no_sandbox: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceSettings {
    Local { root: PathBuf },
    GitHub(GitHubSettings),
}

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub repository: String,
    pub git_ref: String,
    pub token: Option<Secret>,
    pub api_base: String,
    pub raw_base: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsOverrides {
    pub local_mode: bool,
}

/// Resolve settings with precedence flag > env > config > default.
pub fn resolve_settings(
    config: &SyncConfig,
    paths: &ResolvedPaths,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    resolve_settings_with_lookup(config, paths, overrides, |key| std::env::var(key).ok())
}

pub(crate) fn resolve_settings_with_lookup<F>(
    config: &SyncConfig,
    paths: &ResolvedPaths,
    overrides: SettingsOverrides,
    lookup_env: F,
) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let env = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let wiki = WikiSettings {
        base_url: env("WIKI_BASE_URL")
            .or_else(|| config.wiki.base_url.clone())
            .unwrap_or_else(|| DEFAULT_WIKI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        project: env("WIKI_PROJECT").or_else(|| config.wiki.project.clone()),
        session_cookie_name: config
            .wiki
            .session_cookie_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION_COOKIE_NAME.to_string()),
        session_cookie: env("WIKI_SESSION_SID").map(Secret::new),
    };

    let target_branches = match env("SYNC_TARGET_BRANCH") {
        Some(value) => split_list(&value),
        None => config
            .webhook
            .target_branches
            .clone()
            .unwrap_or_else(|| DEFAULT_TARGET_BRANCHES.map(str::to_string).to_vec()),
    };
    if target_branches.is_empty() {
        bail!("webhook target branch list cannot be empty");
    }
    let webhook = WebhookSettings {
        secret: env("WEBHOOK_SECRET").map(Secret::new),
        target_branches,
    };

    let batch_size = match env("SYNC_BATCH_SIZE") {
        Some(value) => value
            .parse::<usize>()
            .with_context(|| format!("invalid SYNC_BATCH_SIZE: {value}"))?,
        None => config.sync.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
    };
    let batch_size = NonZeroUsize::new(batch_size)
        .ok_or_else(|| anyhow::anyhow!("sync batch size must be a positive integer"))?;

    let local_mode = overrides.local_mode
        || match env("IS_LOCAL") {
            Some(value) => parse_bool("IS_LOCAL", &value)?,
            None => config.sync.local.unwrap_or(false),
        };

    let templates = TemplateSet {
        style: resolve_template(
            Category::Style,
            &config.templates.style,
            env("USER_CSS_EYECATCH_URL"),
        ),
        script: resolve_template(
            Category::Script,
            &config.templates.script,
            env("USER_SCRIPT_EYECATCH_URL"),
        ),
    };

    let browser = BrowserSettings {
        headless: match env("BROWSER_HEADLESS") {
            Some(value) => parse_bool("BROWSER_HEADLESS", &value)?,
            None => config.browser.headless.unwrap_or(true),
        },
        executable: env("CHROME_EXECUTABLE")
            .map(PathBuf::from)
            .or_else(|| config.browser.executable.clone()),
        timeout: Duration::from_secs(match env("BROWSER_TIMEOUT_SECS") {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("invalid BROWSER_TIMEOUT_SECS: {value}"))?,
            None => config
                .browser
                .timeout_secs
                .unwrap_or(DEFAULT_BROWSER_TIMEOUT_SECS),
        }),
        no_sandbox: config.browser.no_sandbox.unwrap_or(true),
    };

    let kind = match env("SOURCE_KIND") {
        Some(value) => SourceKind::parse(&value)?,
        None => config.source.kind.unwrap_or_default(),
    };
    let source = match kind {
        SourceKind::Local => SourceSettings::Local {
            root: match config.source.root.as_deref() {
                Some(root) if root.is_absolute() => root.to_path_buf(),
                Some(root) => paths.project_root.join(root),
                None => paths.project_root.clone(),
            },
        },
        SourceKind::Github => {
            let repository = env("GITHUB_REPOSITORY")
                .or_else(|| config.source.repository.clone())
                .ok_or_else(|| {
                    anyhow::anyhow!("github source requires a repository (set GITHUB_REPOSITORY)")
                })?;
            if repository.split('/').filter(|part| !part.is_empty()).count() != 2 {
                bail!("github repository must look like owner/name: {repository}");
            }
            SourceSettings::GitHub(GitHubSettings {
                repository,
                git_ref: config
                    .source
                    .git_ref
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GIT_REF.to_string()),
                token: env("GITHUB_TOKEN").map(Secret::new),
                api_base: config
                    .source
                    .api_base
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE.to_string()),
                raw_base: config
                    .source
                    .raw_base
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GITHUB_RAW_BASE.to_string()),
            })
        }
    };

    Ok(Settings {
        wiki,
        webhook,
        batch_size,
        local_mode,
        templates,
        browser,
        source,
    })
}

impl Settings {
    /// Human-readable settings dump with credentials reduced to set/unset.
    pub fn diagnostics(&self) -> String {
        let mut lines = vec![
            format!("wiki.base_url={}", self.wiki.base_url),
            format!(
                "wiki.project={}",
                self.wiki.project.as_deref().unwrap_or("<unset>")
            ),
            format!("wiki.session_cookie_name={}", self.wiki.session_cookie_name),
            format!(
                "wiki.session_cookie={}",
                set_flag(self.wiki.session_cookie.is_some())
            ),
            format!("webhook.secret={}", set_flag(self.webhook.secret.is_some())),
            format!(
                "webhook.target_branches={}",
                self.webhook.target_branches.join(",")
            ),
            format!("sync.batch_size={}", self.batch_size),
            format!("sync.local={}", self.local_mode),
        ];
        for category in Category::ALL {
            let template = self.templates.for_category(category);
            lines.push(format!("templates.{category}.tag={}", template.tag));
            lines.push(format!(
                "templates.{category}.eyecatch_url={}",
                template.eyecatch_url.as_deref().unwrap_or("<unset>")
            ));
        }
        lines.push(format!("browser.headless={}", self.browser.headless));
        lines.push(format!(
            "browser.executable={}",
            self.browser
                .executable
                .as_deref()
                .map(normalize_for_display)
                .unwrap_or_else(|| "<auto>".to_string())
        ));
        lines.push(format!(
            "browser.timeout_secs={}",
            self.browser.timeout.as_secs()
        ));
        lines.push(format!("browser.no_sandbox={}", self.browser.no_sandbox));
        match &self.source {
            SourceSettings::Local { root } => {
                lines.push("source.kind=local".to_string());
                lines.push(format!("source.root={}", normalize_for_display(root)));
            }
            SourceSettings::GitHub(github) => {
                lines.push("source.kind=github".to_string());
                lines.push(format!("source.repository={}", github.repository));
                lines.push(format!("source.git_ref={}", github.git_ref));
                lines.push(format!("source.token={}", set_flag(github.token.is_some())));
            }
        }
        lines.join("\n")
    }
}

/// Commented config template written by `pagesync init`.
pub fn render_default_config() -> String {
    format!(
        "# pagesync configuration (materialized by `pagesync init`)\n# Credentials are read from the environment only:\n#   WEBHOOK_SECRET, WIKI_SESSION_SID, GITHUB_TOKEN\n\n[wiki]\nbase_url = \"{DEFAULT_WIKI_BASE_URL}\"\n# project = \"your-project\"\nsession_cookie_name = \"{DEFAULT_SESSION_COOKIE_NAME}\"\n\n[webhook]\ntarget_branches = [\"main\", \"master\"]\n\n[sync]\nbatch_size = {DEFAULT_BATCH_SIZE}\nlocal = false\n\n[templates.style]\ntag = \"{}\"\n# eyecatch_url = \"https://example.org/css.png\"\n\n[templates.script]\ntag = \"{}\"\n# eyecatch_url = \"https://example.org/js.png\"\n\n[browser]\nheadless = true\ntimeout_secs = {DEFAULT_BROWSER_TIMEOUT_SECS}\nno_sandbox = true\n# executable = \"/usr/bin/chromium\"\n\n[source]\nkind = \"local\"\n# kind = \"github\"\n# repository = \"owner/name\"\n# git_ref = \"{DEFAULT_GIT_REF}\"\n",
        Category::Style.default_tag(),
        Category::Script.default_tag(),
    )
}

fn resolve_template(
    category: Category,
    section: &TemplateSection,
    env_eyecatch: Option<String>,
) -> PageTemplate {
    let tag = section
        .tag
        .clone()
        .filter(|tag| !tag.trim().is_empty())
        .unwrap_or_else(|| category.default_tag().to_string());
    let eyecatch_url = env_eyecatch.or_else(|| {
        section
            .eyecatch_url
            .clone()
            .filter(|url| !url.trim().is_empty())
    });
    PageTemplate::new(tag, eyecatch_url)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid boolean for {key}: {value}"),
    }
}

fn set_flag(value: bool) -> &'static str {
    if value { "set" } else { "unset" }
}
