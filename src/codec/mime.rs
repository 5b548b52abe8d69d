use std::fmt;

/// The content type of a message body.
///
/// Well-known types are recognised regardless of casing, surrounding whitespace,
/// parameters (e.g. `;charset=utf-8`) or common aliases. Anything else is carried verbatim
/// in [`MimeType::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MimeType {
    Json,
    Yaml,
    Text,
    Other(String),
}

impl MimeType {
    /// Parse the value of a `content-type` property.
    ///
    /// Returns `None` if `raw` is blank.
    pub fn parse(raw: &str) -> Option<Self> {
        let essence = raw.split(';').next().unwrap_or_default().trim();
        if essence.is_empty() {
            return None;
        }
        let mimetype = match essence.to_ascii_lowercase().as_str() {
            "application/json" | "text/json" | "application/x-json" | "json" => Self::Json,
            "application/yaml" | "application/x-yaml" | "text/yaml" | "text/x-yaml" | "yaml" => {
                Self::Yaml
            }
            "text/plain" | "text" | "plain" => Self::Text,
            _ => Self::Other(essence.to_owned()),
        };
        Some(mimetype)
    }

    /// The canonical name of the content type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Json => "application/json",
            Self::Yaml => "application/yaml",
            Self::Text => "text/plain",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MimeType {
    fn from(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| Self::Other(String::new()))
    }
}
