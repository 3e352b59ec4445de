use anyhow::bail;
use tracing::info;

use crate::config::Config;
use crate::storage::KvStore;
use crate::store::{LoadOutcome, MALFORMED_SUFFIX, TodoStore};
use crate::theme::{THEME_KEY, Theme, ThemeProvider};

/// Both providers, built once at startup and handed to the front-end.
pub struct AppContext<S> {
    pub todos: TodoStore<S>,
    pub theme: ThemeProvider<S>,
}

impl<S: KvStore + Clone> AppContext<S> {
    pub fn new(backend: S, cfg: &Config) -> anyhow::Result<Self> {
        let key = cfg.storage_key();
        if key == THEME_KEY {
            bail!("storage.key cannot be '{THEME_KEY}'; that slot holds the theme");
        }
        if key.contains(MALFORMED_SUFFIX) {
            bail!("storage.key cannot contain '{MALFORMED_SUFFIX}'; those slots hold backups");
        }

        let todos = TodoStore::with_key(backend.clone(), &key)?;
        let theme = ThemeProvider::new(backend, cfg.theme_persist()?);
        Ok(Self { todos, theme })
    }

    /// Loads the todo list and the stored theme.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> (LoadOutcome, Theme) {
        let (outcome, theme) = tokio::join!(self.todos.load(), self.theme.load());
        info!(?outcome, %theme, "providers ready");
        (outcome, theme)
    }
}
