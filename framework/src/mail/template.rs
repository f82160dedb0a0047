//! Line-oriented email templates with `=^NAME^=` placeholders.
//!
//! A template's first line is the subject; everything after the first line
//! break is the HTML body. Placeholders only appear in the body and are
//! replaced in a single pass, so replacement values are never re-scanned.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

const OPEN: &str = "=^";
const CLOSE: &str = "^=";

/// Job purposes and the template each one renders.
pub const PURPOSE_TEMPLATES: &[(&str, &str)] = &[
    ("create", "create_cert"),
    ("delete", "delete_cert"),
    ("forgot", "forgot_cert"),
];

/// Resolve a job purpose to its template name.
pub fn template_for_purpose(purpose: &str) -> Option<&'static str> {
    PURPOSE_TEMPLATES
        .iter()
        .find(|(p, _)| *p == purpose)
        .map(|(_, template)| *template)
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid template name: {0:?}")]
    InvalidName(String),

    #[error("template {name} not found")]
    NotFound {
        name: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("failed to read template {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("template {0} is malformed: expected a subject line followed by a body")]
    Malformed(String),
}

/// Subject and body produced by [`TemplateRenderer::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Where raw template text comes from.
///
/// Names passed to [`load`](TemplateSource::load) have already been validated
/// by the renderer.
#[async_trait]
pub trait TemplateSource: Send + Sync + 'static {
    async fn load(&self, name: &str) -> Result<String, TemplateError>;
}

/// Templates stored as `<dir>/<name>.html` files.
#[derive(Debug, Clone)]
pub struct FsTemplates {
    dir: PathBuf,
}

impl FsTemplates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl TemplateSource for FsTemplates {
    async fn load(&self, name: &str) -> Result<String, TemplateError> {
        let path = self.dir.join(format!("{name}.html"));
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => TemplateError::NotFound {
                    name: name.to_string(),
                    source: Some(source),
                },
                _ => TemplateError::Io {
                    name: name.to_string(),
                    source,
                },
            })
    }
}

/// In-memory templates, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplates {
    templates: HashMap<String, String>,
}

impl StaticTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template.
    pub fn with(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.templates.insert(name.into(), content.into());
        self
    }
}

#[async_trait]
impl TemplateSource for StaticTemplates {
    async fn load(&self, name: &str) -> Result<String, TemplateError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound {
                name: name.to_string(),
                source: None,
            })
    }
}

/// Loads templates from a [`TemplateSource`] and fills in placeholders.
///
/// Templates are loaded fresh on every call; there is no cache.
pub struct TemplateRenderer {
    source: Box<dyn TemplateSource>,
}

impl TemplateRenderer {
    pub fn new(source: impl TemplateSource) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    pub async fn render(
        &self,
        name: &str,
        replacements: &HashMap<String, String>,
    ) -> Result<RenderedMessage, TemplateError> {
        let name = validate_name(name)?;
        let content = self.source.load(name).await?;

        let (subject, body) = content
            .split_once('\n')
            .ok_or_else(|| TemplateError::Malformed(name.to_string()))?;

        Ok(RenderedMessage {
            subject: subject.trim_end_matches('\r').to_string(),
            body: substitute(body, replacements),
        })
    }
}

/// Only plain file stems are accepted, which rules out path traversal.
fn validate_name(name: &str) -> Result<&str, TemplateError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(name)
    } else {
        Err(TemplateError::InvalidName(name.to_string()))
    }
}

fn substitute(body: &str, replacements: &HashMap<String, String>) -> String {
    if replacements.is_empty() {
        return body.to_string();
    }

    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];

        let value = after
            .find(CLOSE)
            .and_then(|end| replacements.get(&after[..end]).map(|v| (end, v)));

        match value {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + CLOSE.len()..];
            }
            None => {
                // Not a known token; keep the opener and scan on from the next char.
                out.push_str(OPEN);
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
