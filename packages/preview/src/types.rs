use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Sandbox-reported binding state of one port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port: u16,
    pub origin: Option<String>,
    pub ready: bool,
}

impl PortInfo {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            origin: None,
            ready: false,
        }
    }
}

/// Port state shared by every preview of the same port
pub type SharedPortInfo = Arc<RwLock<PortInfo>>;

/// A user-facing preview of one port and pathname.
///
/// Clones share the same [`PortInfo`], so readiness updates are visible to
/// every holder.
#[derive(Clone)]
pub struct PreviewInfo {
    port_info: SharedPortInfo,
    title: Option<String>,
    pathname: String,
}

impl PreviewInfo {
    pub fn new(port_info: SharedPortInfo, title: Option<String>, pathname: Option<&str>) -> Self {
        Self {
            port_info,
            title,
            pathname: normalize_pathname(pathname),
        }
    }

    pub fn port(&self) -> u16 {
        self.read().port
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    pub fn ready(&self) -> bool {
        self.read().ready
    }

    pub fn origin(&self) -> Option<String> {
        self.read().origin.clone()
    }

    /// Origin joined with the pathname, once the origin is known
    pub fn url(&self) -> Option<String> {
        self.read()
            .origin
            .as_ref()
            .map(|origin| format!("{}{}", origin.trim_end_matches('/'), self.pathname))
    }

    pub fn port_info(&self) -> &SharedPortInfo {
        &self.port_info
    }

    /// Same (port, pathname, title) identity
    pub fn matches(&self, port: u16, pathname: &str, title: Option<&str>) -> bool {
        self.port() == port && self.pathname == pathname && self.title.as_deref() == title
    }

    pub fn state(&self) -> PreviewState {
        let info = self.read();
        PreviewState {
            port: info.port,
            title: self.title.clone(),
            pathname: self.pathname.clone(),
            ready: info.ready,
            url: info
                .origin
                .as_ref()
                .map(|origin| format!("{}{}", origin.trim_end_matches('/'), self.pathname)),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PortInfo> {
        self.port_info.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Identity is port, pathname, and title; readiness and origin are ignored.
impl PartialEq for PreviewInfo {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other.port(), &other.pathname, other.title())
    }
}

impl Eq for PreviewInfo {}

impl fmt::Debug for PreviewInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.read();
        f.debug_struct("PreviewInfo")
            .field("port", &info.port)
            .field("title", &self.title)
            .field("pathname", &self.pathname)
            .field("ready", &info.ready)
            .field("origin", &info.origin)
            .finish()
    }
}

/// Point-in-time view of a preview, for rendering and change detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewState {
    pub port: u16,
    pub title: Option<String>,
    pub pathname: String,
    pub ready: bool,
    pub url: Option<String>,
}

fn normalize_pathname(pathname: Option<&str>) -> String {
    match pathname.map(str::trim) {
        None | Some("") => "/".to_string(),
        Some(path) if path.starts_with('/') => path.to_string(),
        Some(path) => format!("/{}", path),
    }
}

/// A resolved preview declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSpec {
    pub port: u16,
    pub title: Option<String>,
    pub pathname: Option<String>,
}

impl PreviewSpec {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            title: None,
            pathname: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = Some(pathname.into());
        self
    }
}

/// One preview entry as written in lesson metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreviewSchema {
    /// `3000`
    Port(u16),
    /// `"3000/docs"`
    Path(String),
    /// `[3000, "Title", "/docs"]`
    TitledPath(u16, String, String),
    /// `[3000, "Title"]`
    Titled(u16, String),
    /// `{ "port": 3000, "title": "Docs", "pathname": "/docs" }`
    Object {
        port: u16,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        pathname: Option<String>,
    },
}

impl TryFrom<&PreviewSchema> for PreviewSpec {
    type Error = PreviewError;

    fn try_from(schema: &PreviewSchema) -> PreviewResult<Self> {
        Ok(match schema {
            PreviewSchema::Port(port) => PreviewSpec::new(*port),
            PreviewSchema::Path(value) => {
                let (port, pathname) = match value.split_once('/') {
                    Some((port, rest)) => (port, Some(format!("/{}", rest))),
                    None => (value.as_str(), None),
                };
                let port = port
                    .trim()
                    .parse()
                    .map_err(|_| PreviewError::InvalidPreview(value.clone()))?;
                PreviewSpec {
                    port,
                    title: None,
                    pathname,
                }
            }
            PreviewSchema::TitledPath(port, title, pathname) => PreviewSpec::new(*port)
                .with_title(title.clone())
                .with_pathname(pathname.clone()),
            PreviewSchema::Titled(port, title) => PreviewSpec::new(*port).with_title(title.clone()),
            PreviewSchema::Object {
                port,
                title,
                pathname,
            } => PreviewSpec {
                port: *port,
                title: title.clone(),
                pathname: pathname.clone(),
            },
        })
    }
}

/// The `previews` block of lesson metadata: `false` disables previews,
/// `true` previews every open port, a list pins the previews shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreviewsSchema {
    Toggle(bool),
    List(Vec<PreviewSchema>),
}

impl PreviewsSchema {
    /// `None` selects automatic mode.
    pub fn resolve(&self) -> PreviewResult<Option<Vec<PreviewSpec>>> {
        match self {
            PreviewsSchema::Toggle(true) => Ok(None),
            PreviewsSchema::Toggle(false) => Ok(Some(Vec::new())),
            PreviewsSchema::List(entries) => entries
                .iter()
                .map(PreviewSpec::try_from)
                .collect::<PreviewResult<Vec<_>>>()
                .map(Some),
        }
    }
}

/// Error types for preview operations
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("Invalid preview declaration: {0}")]
    InvalidPreview(String),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Result type for preview operations
pub type PreviewResult<T> = Result<T, PreviewError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn shared(port: u16) -> SharedPortInfo {
        Arc::new(RwLock::new(PortInfo::new(port)))
    }

    #[test]
    fn test_url_joins_origin_and_pathname() {
        let info = shared(3000);
        let root = PreviewInfo::new(info.clone(), None, None);
        let docs = PreviewInfo::new(info.clone(), None, Some("docs"));
        assert_eq!(root.url(), None);

        info.write().unwrap().origin = Some("https://x/".to_string());

        assert_eq!(root.url(), Some("https://x/".to_string()));
        assert_eq!(docs.url(), Some("https://x/docs".to_string()));
    }

    #[test]
    fn test_equality_ignores_readiness() {
        let a = PreviewInfo::new(shared(3000), Some("App".into()), Some("/"));
        let b = PreviewInfo::new(shared(3000), Some("App".into()), None);
        assert_eq!(a, a);
        assert_eq!(a, b);

        a.port_info().write().unwrap().ready = true;
        a.port_info().write().unwrap().origin = Some("https://x".into());
        assert_eq!(a, b);

        let other_title = PreviewInfo::new(shared(3000), Some("Docs".into()), None);
        let other_path = PreviewInfo::new(shared(3000), Some("App".into()), Some("/docs"));
        assert_ne!(a, other_title);
        assert_ne!(a, other_path);
    }

    #[test]
    fn test_parse_preview_shapes() {
        let schema: PreviewsSchema = serde_json::from_str(
            r#"[3000, "4000/docs", [5000, "Api"], [6000, "Admin", "/admin"],
                {"port": 7000, "title": "Seven"}]"#,
        )
        .unwrap();

        let specs = schema.resolve().unwrap().unwrap();
        assert_eq!(
            specs,
            vec![
                PreviewSpec::new(3000),
                PreviewSpec::new(4000).with_pathname("/docs"),
                PreviewSpec::new(5000).with_title("Api"),
                PreviewSpec::new(6000)
                    .with_title("Admin")
                    .with_pathname("/admin"),
                PreviewSpec::new(7000).with_title("Seven"),
            ]
        );
    }

    #[test]
    fn test_toggle_and_invalid() {
        let disabled: PreviewsSchema = serde_json::from_str("false").unwrap();
        assert_eq!(disabled.resolve().unwrap(), Some(vec![]));

        let auto: PreviewsSchema = serde_json::from_str("true").unwrap();
        assert_eq!(auto.resolve().unwrap(), None);

        let invalid: PreviewsSchema = serde_json::from_str(r#"["docs/3000"]"#).unwrap();
        assert!(matches!(
            invalid.resolve(),
            Err(PreviewError::InvalidPreview(_))
        ));
    }
}
