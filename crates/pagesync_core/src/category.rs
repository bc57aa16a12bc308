use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Root folder that holds both category directories.
pub const CODE_ROOT: &str = "code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Style,
    Script,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Style, Category::Script];

    /// Short label used in logs and the run summary (`css:<title>`). It is
    /// also the directory name under `code/` and the source file extension.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Style => "css",
            Self::Script => "js",
        }
    }

    /// File name written in the `code:` block header of the wiki page.
    pub fn canonical_filename(self) -> &'static str {
        match self {
            Self::Style => "style.css",
            Self::Script => "script.js",
        }
    }

    pub fn default_tag(self) -> &'static str {
        match self {
            Self::Style => "#UserCSS",
            Self::Script => "#UserScript",
        }
    }

    /// Repository-relative directory enumerated by a full sync.
    pub fn root_dir(self) -> String {
        format!("{CODE_ROOT}/{}", self.as_str())
    }

    fn pattern(self) -> &'static Regex {
        static STYLE: OnceLock<Regex> = OnceLock::new();
        static SCRIPT: OnceLock<Regex> = OnceLock::new();
        let cell = match self {
            Self::Style => &STYLE,
            Self::Script => &SCRIPT,
        };
        cell.get_or_init(|| {
            let source = format!(
                r"^{}/{label}/(.+)/[^/]+\.{label}$",
                regex::escape(CODE_ROOT),
                label = regex::escape(self.as_str())
            );
            Regex::new(&source).expect("category pattern is a valid regex")
        })
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub category: Category,
    pub title: String,
}

/// Map a repository path to its category and page title.
///
/// Returns `None` for paths outside `code/css/<title>/*.css` and
/// `code/js/<title>/*.js`, and for titles that are blank.
pub fn classify(path: &str) -> Option<Classified> {
    let normalized = path.replace('\\', "/");
    let mut matched = Category::ALL.into_iter().filter_map(|category| {
        category
            .pattern()
            .captures(&normalized)
            .and_then(|captures| captures.get(1))
            .map(|title| (category, title.as_str().to_string()))
    });
    let (category, title) = matched.next()?;
    debug_assert!(matched.next().is_none(), "category patterns overlap");
    if title.trim().is_empty() {
        return None;
    }
    Some(Classified { category, title })
}
