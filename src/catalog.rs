use std::{collections::HashMap, fmt::Display, io::Read, path::PathBuf};

use tracing::info;

pub const DEFAULT_CATALOG_URL: &str =
    "https://raw.githubusercontent.com/f/awesome-chatgpt-prompts/main/prompts.csv";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("prompt title \"{0}\" is not found in the catalog")]
    KeyNotFound(String),
    #[error("failed to fetch prompt catalog from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read prompt catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed prompt catalog: {0}")]
    Csv(#[from] csv::Error),
}

/// Prompt templates keyed by title, in the order the catalog lists them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptCatalog {
    titles: Vec<String>,
    prompts: HashMap<String, String>,
}
impl PromptCatalog {
    /// Reads `title,prompt` rows. The header row and any extra columns are ignored.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, CatalogError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let mut catalog = Self::default();
        for record in reader.records() {
            let record = record?;
            if let (Some(title), Some(prompt)) = (record.get(0), record.get(1)) {
                catalog.insert(title, prompt);
            }
        }
        Ok(catalog)
    }
    pub fn get(&self, title: &str) -> Result<&str, CatalogError> {
        self.prompts
            .get(title)
            .map(String::as_str)
            .ok_or_else(|| CatalogError::KeyNotFound(title.to_string()))
    }
    pub fn titles(&self) -> &[String] {
        &self.titles
    }
    pub fn len(&self) -> usize {
        self.titles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
    // a repeated title keeps its first position and its last prompt
    fn insert(&mut self, title: &str, prompt: &str) {
        if self
            .prompts
            .insert(title.to_string(), prompt.to_string())
            .is_none()
        {
            self.titles.push(title.to_string());
        }
    }
}
impl<T: AsRef<str>, U: AsRef<str>> FromIterator<(T, U)> for PromptCatalog {
    fn from_iter<I: IntoIterator<Item = (T, U)>>(iter: I) -> Self {
        let mut catalog = Self::default();
        for (title, prompt) in iter {
            catalog.insert(title.as_ref(), prompt.as_ref());
        }
        catalog
    }
}

pub trait CatalogSource {
    fn load(&self) -> Result<PromptCatalog, CatalogError>;
}

/// Where the catalog CSV lives: an http(s) url or a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogLocation {
    Remote(String),
    File(PathBuf),
}
impl Default for CatalogLocation {
    fn default() -> Self {
        Self::Remote(DEFAULT_CATALOG_URL.to_string())
    }
}
impl From<String> for CatalogLocation {
    fn from(location: String) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Remote(location)
        } else {
            Self::File(PathBuf::from(location))
        }
    }
}
impl Display for CatalogLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{}", url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}
impl CatalogSource for CatalogLocation {
    fn load(&self) -> Result<PromptCatalog, CatalogError> {
        let catalog = match self {
            Self::Remote(url) => {
                let fetch_error = |source| CatalogError::Fetch {
                    url: url.clone(),
                    source,
                };
                let response = reqwest::blocking::get(url.as_str())
                    .and_then(|res| res.error_for_status())
                    .map_err(fetch_error)?;
                PromptCatalog::from_csv(response)?
            }
            Self::File(path) => {
                let file = std::fs::File::open(path).map_err(|source| CatalogError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                PromptCatalog::from_csv(file)?
            }
        };
        info!(source = %self, entries = catalog.len(), "prompt catalog loaded");
        Ok(catalog)
    }
}
