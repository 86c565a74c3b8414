use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{
    bridge::offload,
    domain::{ChatId, UserId},
    Error, Result,
};

/// Quotes shipped with the bot; valid in every chat.
pub const GLOBAL_QUOTES: &[(&str, &str)] = &[
    ("/o/", "\\o\\"),
    ("\\o\\", "/o/"),
    (">_>", "<_<"),
    ("<_<", ">_>"),
    ("-_-", "I am sorry that you are annoyed. I want you to be happy!"),
    ("-.-", "Aww don't be so upsetti, have some spaghetti!"),
    ("<_>", ">_<"),
    (">_<", "<_>"),
    ("|o|", "/o\\"),
    ("xd", "XC"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteScope {
    Global,
    Chat(ChatId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub scope: QuoteScope,
    /// Always lowercase.
    pub keyword: String,
    pub text: String,
    pub author_id: Option<UserId>,
}

impl Quote {
    pub fn new(
        scope: QuoteScope,
        keyword: &str,
        text: impl Into<String>,
        author_id: Option<UserId>,
    ) -> Self {
        Self {
            scope,
            keyword: keyword.trim().to_lowercase(),
            text: text.into(),
            author_id,
        }
    }
}

/// Storage port. Every method may block; async callers go through [`QuoteStoreHandle`].
pub trait QuoteStore: Send + Sync {
    fn connect(&self) -> Result<()>;
    fn create_schema(&self) -> Result<()>;
    fn close(&self) -> Result<()>;

    fn find_quote(&self, scope: QuoteScope, keyword: &str) -> Result<Option<Quote>>;

    /// Inserts or replaces the quote for (scope, keyword). Returns `true` if it was new.
    fn add_quote(&self, quote: Quote) -> Result<bool>;

    /// Returns `true` if a quote was removed.
    fn delete_quote(&self, scope: QuoteScope, keyword: &str) -> Result<bool>;

    /// Every quote of `scope`, oldest first.
    fn list_quotes(&self, scope: QuoteScope) -> Result<Vec<Quote>>;
}

/// Async facade over a [`QuoteStore`]: each call runs on the blocking pool.
#[derive(Clone)]
pub struct QuoteStoreHandle {
    inner: Arc<dyn QuoteStore>,
}

impl QuoteStoreHandle {
    pub fn new(inner: Arc<dyn QuoteStore>) -> Self {
        Self { inner }
    }

    pub async fn connect(&self) -> Result<()> {
        let s = self.inner.clone();
        offload(move || s.connect()).await?
    }

    pub async fn create_schema(&self) -> Result<()> {
        let s = self.inner.clone();
        offload(move || s.create_schema()).await?
    }

    pub async fn close(&self) -> Result<()> {
        let s = self.inner.clone();
        offload(move || s.close()).await?
    }

    pub async fn add_quote(&self, quote: Quote) -> Result<bool> {
        let s = self.inner.clone();
        offload(move || s.add_quote(quote)).await?
    }

    pub async fn delete_quote(&self, scope: QuoteScope, keyword: &str) -> Result<bool> {
        let s = self.inner.clone();
        let keyword = keyword.to_lowercase();
        offload(move || s.delete_quote(scope, &keyword)).await?
    }

    pub async fn list_quotes(&self, scope: QuoteScope) -> Result<Vec<Quote>> {
        let s = self.inner.clone();
        offload(move || s.list_quotes(scope)).await?
    }

    /// Chat-scoped quote first, then the global one.
    pub async fn lookup(&self, chat: ChatId, text: &str) -> Result<Option<Quote>> {
        let s = self.inner.clone();
        let keyword = text.trim().to_lowercase();
        offload(move || match s.find_quote(QuoteScope::Chat(chat), &keyword)? {
            Some(q) => Ok(Some(q)),
            None => s.find_quote(QuoteScope::Global, &keyword),
        })
        .await?
    }

    /// Inserts the built-in global quotes that are missing. Returns how many were added.
    pub async fn seed_global_quotes(&self) -> Result<usize> {
        let s = self.inner.clone();
        offload(move || {
            let mut added = 0;
            for (keyword, text) in GLOBAL_QUOTES {
                if s.find_quote(QuoteScope::Global, keyword)?.is_none() {
                    s.add_quote(Quote::new(QuoteScope::Global, keyword, *text, None))?;
                    added += 1;
                }
            }
            Ok(added)
        })
        .await?
    }
}

#[derive(Default, Serialize, Deserialize)]
struct QuoteFile {
    quotes: Vec<Quote>,
}

/// Quote table persisted as one JSON file, rewritten on every change.
pub struct JsonQuoteStore {
    path: PathBuf,
    state: Mutex<Option<QuoteFile>>,
}

impl JsonQuoteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QuoteFile) -> Result<T>) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::Store("quote store lock poisoned".to_string()))?;
        let file = guard
            .as_mut()
            .ok_or_else(|| Error::Store("quote store is not connected".to_string()))?;
        f(file)
    }

    fn persist(&self, file: &QuoteFile) -> Result<()> {
        let txt = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, txt)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl QuoteStore for JsonQuoteStore {
    fn connect(&self) -> Result<()> {
        let file = if self.path.exists() {
            let txt = std::fs::read_to_string(&self.path)?;
            if txt.trim().is_empty() {
                QuoteFile::default()
            } else {
                serde_json::from_str(&txt)?
            }
        } else {
            QuoteFile::default()
        };

        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::Store("quote store lock poisoned".to_string()))?;
        *guard = Some(file);
        tracing::debug!(path = %self.path.display(), "quote store connected");
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        if self.path.exists() {
            return Ok(());
        }
        self.with_state(|file| self.persist(file))
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::Store("quote store lock poisoned".to_string()))?;
        if guard.take().is_some() {
            tracing::debug!(path = %self.path.display(), "quote store closed");
        }
        Ok(())
    }

    fn find_quote(&self, scope: QuoteScope, keyword: &str) -> Result<Option<Quote>> {
        let keyword = keyword.to_lowercase();
        self.with_state(|file| {
            Ok(file
                .quotes
                .iter()
                .find(|q| q.scope == scope && q.keyword == keyword)
                .cloned())
        })
    }

    fn add_quote(&self, quote: Quote) -> Result<bool> {
        self.with_state(|file| {
            let existing = file
                .quotes
                .iter()
                .position(|q| q.scope == quote.scope && q.keyword == quote.keyword);
            let added = match existing {
                Some(i) => {
                    file.quotes[i] = quote;
                    false
                }
                None => {
                    file.quotes.push(quote);
                    true
                }
            };
            self.persist(file)?;
            Ok(added)
        })
    }

    fn delete_quote(&self, scope: QuoteScope, keyword: &str) -> Result<bool> {
        let keyword = keyword.to_lowercase();
        self.with_state(|file| {
            let before = file.quotes.len();
            file.quotes
                .retain(|q| !(q.scope == scope && q.keyword == keyword));
            let removed = file.quotes.len() != before;
            if removed {
                self.persist(file)?;
            }
            Ok(removed)
        })
    }

    fn list_quotes(&self, scope: QuoteScope) -> Result<Vec<Quote>> {
        self.with_state(|file| {
            Ok(file
                .quotes
                .iter()
                .filter(|q| q.scope == scope)
                .cloned()
                .collect())
        })
    }
}
