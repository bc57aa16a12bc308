use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{BrowserSettings, Settings, WikiSettings};
use crate::protocol::{PageHandle, SessionLauncher, WikiSession};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const BLANK_PAGE: &str = "about:blank";

/// Launches a local Chromium and authenticates it against the wiki.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    browser: BrowserSettings,
    wiki: WikiSettings,
}

impl ChromeLauncher {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            browser: settings.browser.clone(),
            wiki: settings.wiki.clone(),
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder().request_timeout(self.browser.timeout);
        if !self.browser.headless {
            builder = builder.with_head();
        }
        if self.browser.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(executable) = &self.browser.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(anyhow::Error::msg)
    }

    fn session_cookie(&self) -> Result<CookieParam> {
        let value = self.wiki.require_session_cookie()?;
        CookieParam::builder()
            .name(self.wiki.session_cookie_name.clone())
            .value(value.expose())
            .url(self.wiki.base_url.clone())
            .domain(cookie_domain(&self.wiki.base_url)?)
            .path("/")
            .secure(self.wiki.base_url.starts_with("https://"))
            .http_only(true)
            .build()
            .map_err(anyhow::Error::msg)
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    type Session = ChromeSession;

    async fn launch(&self) -> Result<ChromeSession> {
        let cookie = self.session_cookie()?;
        let config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(error) = event {
                    debug!(%error, "browser handler error");
                }
            }
        });
        let mut session = ChromeSession {
            browser,
            handler_task,
            timeout: self.browser.timeout,
        };
        info!(headless = self.browser.headless, "browser launched");

        if let Err(error) = session.install_cookie(cookie).await {
            if let Err(close_error) = session.close().await {
                warn!(error = %format!("{close_error:#}"), "failed to close browser after login failure");
            }
            return Err(error);
        }
        Ok(session)
    }
}

pub struct ChromeSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    timeout: Duration,
}

impl ChromeSession {
    async fn install_cookie(&self, cookie: CookieParam) -> Result<()> {
        let page = self
            .browser
            .new_page(BLANK_PAGE)
            .await
            .context("failed to open bootstrap page")?;
        page.set_cookie(cookie)
            .await
            .context("failed to install wiki session cookie")?;
        page.close().await.context("failed to close bootstrap page")?;
        debug!("wiki session cookie installed");
        Ok(())
    }
}

#[async_trait]
impl WikiSession for ChromeSession {
    type Page = ChromePage;

    async fn open_page(&self) -> Result<ChromePage> {
        let page = self
            .browser
            .new_page(BLANK_PAGE)
            .await
            .context("failed to open browser tab")?;
        accept_dialogs(&page).await?;
        Ok(ChromePage {
            page,
            timeout: self.timeout,
        })
    }

    async fn close(&mut self) -> Result<()> {
        let closed = self.browser.close().await.context("failed to close browser");
        if let Err(error) = self.browser.wait().await {
            warn!(%error, "browser process did not exit cleanly");
        }
        self.handler_task.abort();
        closed.map(|_| ())
    }
}

async fn accept_dialogs(page: &Page) -> Result<()> {
    let mut dialogs = page
        .event_listener::<EventJavascriptDialogOpening>()
        .await
        .context("failed to subscribe to page dialogs")?;
    let page = page.clone();
    tokio::spawn(async move {
        while let Some(dialog) = dialogs.next().await {
            debug!(message = %dialog.message, "accepting dialog");
            if let Err(error) = page.execute(HandleJavaScriptDialogParams::new(true)).await {
                warn!(%error, "failed to accept dialog");
            }
        }
    });
    Ok(())
}

/// One browser tab.
#[derive(Clone)]
pub struct ChromePage {
    page: Page,
    timeout: Duration,
}

impl ChromePage {
    async fn current_url(&self) -> Result<Option<String>> {
        self.page.url().await.context("failed to read page url")
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("failed to open {}", display_url(url)))?;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str) -> Result<()> {
        let poll = async {
            loop {
                let found = self
                    .page
                    .find_elements(selector)
                    .await
                    .map(|elements| !elements.is_empty())
                    .unwrap_or(false);
                if found {
                    return;
                }
                sleep(POLL_INTERVAL).await;
            }
        };
        timeout(self.timeout, poll).await.map_err(|_| {
            anyhow!(
                "timed out after {}s waiting for {selector}",
                self.timeout.as_secs()
            )
        })
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("no element matches {selector}"))?;
        element
            .click()
            .await
            .with_context(|| format!("failed to click {selector}"))?;
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let elements = self
            .page
            .find_elements(selector)
            .await
            .with_context(|| format!("failed to query {selector}"))?;
        Ok(!elements.is_empty())
    }

    async fn wait_for_navigation(&self) -> Result<()> {
        let before = self.current_url().await?;
        let poll = async {
            loop {
                sleep(POLL_INTERVAL).await;
                if self.current_url().await? != before {
                    return Ok::<(), anyhow::Error>(());
                }
            }
        };
        timeout(self.timeout, poll).await.map_err(|_| {
            anyhow!(
                "timed out after {}s waiting for navigation",
                self.timeout.as_secs()
            )
        })?
    }

    async fn close(&self) -> Result<()> {
        self.page
            .clone()
            .close()
            .await
            .context("failed to close browser tab")
    }
}

/// Host part of `base_url`, used as the cookie domain.
fn cookie_domain(base_url: &str) -> Result<String> {
    let without_scheme = base_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(base_url);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    let host = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority);
    let host = host.split(':').next().unwrap_or_default();
    if host.is_empty() {
        return Err(anyhow!("wiki base url has no host: {base_url}"));
    }
    Ok(host.to_string())
}

/// Creation URLs carry the whole page body; keep logs and errors short.
fn display_url(url: &str) -> &str {
    url.split_once('?').map(|(path, _)| path).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::settings;

    #[test]
    fn cookie_domain_is_the_bare_host() {
        assert_eq!(
            cookie_domain("https://scrapbox.io").expect("domain"),
            "scrapbox.io"
        );
        assert_eq!(
            cookie_domain("http://localhost:8080/wiki").expect("domain"),
            "localhost"
        );
        assert!(cookie_domain("https:///nothing").is_err());
    }

    #[test]
    fn display_url_drops_query() {
        assert_eq!(
            display_url("https://scrapbox.io/p/greet?body=%0Acode"),
            "https://scrapbox.io/p/greet"
        );
        assert_eq!(display_url("https://scrapbox.io/p/x"), "https://scrapbox.io/p/x");
    }

    #[test]
    fn launcher_requires_session_cookie() {
        let error = ChromeLauncher::from_settings(&settings(&[]))
            .session_cookie()
            .expect_err("cookie required");
        assert!(error.to_string().contains("WIKI_SESSION_SID"));

        let launcher = ChromeLauncher::from_settings(&settings(&[("WIKI_SESSION_SID", "sid")]));
        let cookie = launcher.session_cookie().expect("cookie");
        assert_eq!(cookie.name, "connect.sid");
        assert_eq!(cookie.value, "sid");
        assert_eq!(cookie.domain.as_deref(), Some("scrapbox.io"));
        assert_eq!(cookie.secure, Some(true));
    }
}
