//! The todo store: an in-memory list mirrored to one key-value slot.
//!
//! Every mutation rewrites the whole persisted list. Mutations and loads are
//! funneled through a single write gate so that each one sees the list left
//! by the previous one; reads go to the last published snapshot and never
//! wait on storage.

use std::collections::HashSet;
use std::fmt;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::storage::{KvStore, NotText, validate_key};
use crate::todo::{Priority, Todo, TodoPatch, next_id, normalize_title};

pub const DEFAULT_TODOS_KEY: &str = "todos";
/// Unparseable slots are copied to `<key>.malformed` before the list resets.
pub const MALFORMED_SUFFIX: &str = ".malformed";

/// State published to subscribers after every load or mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoSnapshot {
    pub todos: Vec<Todo>,
    /// True until the first `load` resolves.
    pub loading: bool,
    /// True while the in-memory list differs from what was last written.
    pub dirty: bool,
}

impl Default for TodoSnapshot {
    fn default() -> Self {
        Self {
            todos: vec![],
            loading: true,
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyTitle,
    NotFound(String),
    /// The slot has never been read successfully, so writing would clobber it.
    StorageUnread,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTitle => f.write_str("title cannot be empty"),
            Self::NotFound(id) => write!(f, "no todo with id {id}"),
            Self::StorageUnread => {
                f.write_str("stored todos could not be read; refusing to overwrite them")
            }
        }
    }
}

/// Result of a store mutation.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Applied in memory and written to storage.
    Persisted(T),
    /// Applied in memory, but the write failed; the store stays dirty until a
    /// later write succeeds.
    Unpersisted { value: T, error: anyhow::Error },
    /// Nothing changed.
    Rejected(Rejection),
}

impl<T> Mutation<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Persisted(value) | Self::Unpersisted { value, .. } => Some(value),
            Self::Rejected(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Persisted(value) | Self::Unpersisted { value, .. } => Some(value),
            Self::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The slot held a list with this many records.
    Loaded(usize),
    /// Nothing stored yet.
    Empty,
    /// The slot could not be parsed; the list was reset to empty.
    Malformed,
    /// Storage could not be read; the in-memory list was kept. Mutations are
    /// refused until a load succeeds.
    Failed,
}

#[derive(Debug, Default)]
struct Writer {
    last_issued: u64,
    /// Set once the slot has been read, or found unreadable and copied aside.
    slot_read: bool,
}

pub struct TodoStore<S> {
    backend: S,
    key: String,
    state: watch::Sender<TodoSnapshot>,
    writer: Mutex<Writer>,
}

impl<S: KvStore> TodoStore<S> {
    pub fn new(backend: S) -> Self {
        Self {
            backend,
            key: DEFAULT_TODOS_KEY.to_string(),
            state: watch::Sender::new(TodoSnapshot::default()),
            writer: Mutex::new(Writer::default()),
        }
    }

    pub fn with_key(backend: S, key: &str) -> anyhow::Result<Self> {
        validate_key(key).context("invalid todo storage key")?;
        let mut store = Self::new(backend);
        store.key = key.to_string();
        Ok(store)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot(&self) -> TodoSnapshot {
        self.state.borrow().clone()
    }

    pub fn todos(&self) -> Vec<Todo> {
        self.state.borrow().todos.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn is_dirty(&self) -> bool {
        self.state.borrow().dirty
    }

    /// Receives a new snapshot after every load and mutation.
    pub fn subscribe(&self) -> watch::Receiver<TodoSnapshot> {
        self.state.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Todo> {
        self.state
            .borrow()
            .todos
            .iter()
            .find(|todo| todo.id == id)
            .cloned()
    }

    #[tracing::instrument(skip(self), fields(key = %self.key))]
    pub async fn load(&self) -> LoadOutcome {
        let mut writer = self.writer.lock().await;

        let outcome = match self.backend.get(&self.key).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => {
                match serde_json::from_str::<Vec<Todo>>(&raw) {
                    Ok(todos) => {
                        let todos = dedupe_ids(todos);
                        let count = todos.len();
                        self.publish(todos, false);
                        writer.slot_read = true;
                        info!(count, "loaded todos");
                        LoadOutcome::Loaded(count)
                    }
                    Err(err) => {
                        error!(error = %err, "stored todo list is malformed; starting empty");
                        writer.slot_read = self.preserve_malformed().await;
                        self.publish(vec![], false);
                        LoadOutcome::Malformed
                    }
                }
            }
            Ok(_) => {
                debug!("no stored todos");
                self.publish(vec![], false);
                writer.slot_read = true;
                LoadOutcome::Empty
            }
            Err(err) if err.downcast_ref::<NotText>().is_some() => {
                error!(error = %err, "stored todo list is not text; starting empty");
                writer.slot_read = self.preserve_malformed().await;
                self.publish(vec![], false);
                LoadOutcome::Malformed
            }
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    "failed loading todos; keeping current list"
                );
                LoadOutcome::Failed
            }
        };

        self.state.send_modify(|snap| snap.loading = false);
        outcome
    }

    pub async fn refresh(&self) -> LoadOutcome {
        self.load().await
    }

    #[tracing::instrument(skip(self, title), fields(title_len = title.len()))]
    pub async fn add(&self, title: &str, priority: Option<Priority>) -> Mutation<Todo> {
        let Some(title) = normalize_title(title) else {
            debug!("rejected blank title");
            return Mutation::Rejected(Rejection::EmptyTitle);
        };

        let mut writer = self.writer.lock().await;
        if !writer.slot_read {
            return refuse_unread();
        }
        let mut todos = self.todos();

        let id = next_id(&todos, writer.last_issued, Utc::now().timestamp_millis());
        writer.last_issued = id;

        let todo = Todo::new(id.to_string(), title, priority);
        todos.push(todo.clone());
        info!(id = %todo.id, count = todos.len(), "todo added");

        self.commit(todos, todo).await
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, mut patch: TodoPatch) -> Mutation<Todo> {
        if let Some(raw) = patch.title.take() {
            let Some(title) = normalize_title(&raw) else {
                debug!("rejected blank title");
                return Mutation::Rejected(Rejection::EmptyTitle);
            };
            patch.title = Some(title);
        }

        let writer = self.writer.lock().await;
        if !writer.slot_read {
            return refuse_unread();
        }
        self.update_locked(id, &patch).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn toggle(&self, id: &str) -> Mutation<Todo> {
        let writer = self.writer.lock().await;
        if !writer.slot_read {
            return refuse_unread();
        }
        let Some(current) = self.get(id) else {
            debug!("toggle target not found");
            return Mutation::Rejected(Rejection::NotFound(id.to_string()));
        };
        self.update_locked(id, &TodoPatch::completed(!current.completed))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Mutation<Todo> {
        let writer = self.writer.lock().await;
        if !writer.slot_read {
            return refuse_unread();
        }
        let mut todos = self.todos();

        let Some(idx) = todos.iter().position(|todo| todo.id == id) else {
            debug!("delete target not found");
            return Mutation::Rejected(Rejection::NotFound(id.to_string()));
        };
        let removed = todos.remove(idx);
        info!(id = %removed.id, count = todos.len(), "todo deleted");

        self.commit(todos, removed).await
    }

    /// Writes the in-memory list if the last write failed. Yields the number
    /// of records in the list.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&self) -> Mutation<usize> {
        let _writer = self.writer.lock().await;
        let snap = self.snapshot();
        if !snap.dirty {
            return Mutation::Persisted(snap.todos.len());
        }
        let count = snap.todos.len();
        self.commit(snap.todos, count).await
    }

    async fn update_locked(&self, id: &str, patch: &TodoPatch) -> Mutation<Todo> {
        let mut todos = self.todos();
        let Some(todo) = todos.iter_mut().find(|todo| todo.id == id) else {
            debug!(id, "update target not found");
            return Mutation::Rejected(Rejection::NotFound(id.to_string()));
        };

        todo.apply(patch);
        let updated = todo.clone();
        info!(id = %updated.id, completed = updated.completed, "todo updated");

        self.commit(todos, updated).await
    }

    /// Persists `todos`, then publishes it whether or not the write succeeded.
    async fn commit<T>(&self, todos: Vec<Todo>, value: T) -> Mutation<T> {
        let result = self.persist(&todos).await;
        self.publish(todos, result.is_err());

        match result {
            Ok(()) => Mutation::Persisted(value),
            Err(error) => {
                error!(
                    key = %self.key,
                    error = %format!("{error:#}"),
                    "failed saving todos; change kept in memory only"
                );
                Mutation::Unpersisted { value, error }
            }
        }
    }

    async fn persist(&self, todos: &[Todo]) -> anyhow::Result<()> {
        let raw = serde_json::to_string(todos).context("failed to serialize todo list")?;
        self.backend
            .set(&self.key, &raw)
            .await
            .with_context(|| format!("failed to write storage slot {}", self.key))
    }

    /// Copies the current slot aside without replacing an earlier copy.
    /// Returns whether the raw data is safe to overwrite.
    async fn preserve_malformed(&self) -> bool {
        let first_choice = format!("{}{MALFORMED_SUFFIX}", self.key);
        let backup_key = match self.backend.get(&first_choice).await {
            Ok(None) => first_choice,
            _ => format!("{first_choice}-{}", Utc::now().timestamp_millis()),
        };

        match self.backend.copy(&self.key, &backup_key).await {
            Ok(_) => {
                warn!(backup = %backup_key, "kept unreadable todo data");
                true
            }
            Err(err) => {
                warn!(
                    backup = %backup_key,
                    error = %format!("{err:#}"),
                    "could not keep unreadable todo data"
                );
                false
            }
        }
    }

    fn publish(&self, todos: Vec<Todo>, dirty: bool) {
        self.state.send_modify(|snap| {
            snap.todos = todos;
            snap.dirty = dirty;
        });
    }
}

fn refuse_unread<T>() -> Mutation<T> {
    warn!("todo storage was never read; refusing to write");
    Mutation::Rejected(Rejection::StorageUnread)
}

fn dedupe_ids(todos: Vec<Todo>) -> Vec<Todo> {
    let mut seen = HashSet::with_capacity(todos.len());
    let before = todos.len();
    let kept: Vec<Todo> = todos
        .into_iter()
        .filter(|todo| seen.insert(todo.id.clone()))
        .collect();

    if kept.len() != before {
        warn!(
            before,
            after = kept.len(),
            "dropped stored todos with duplicate ids"
        );
    }
    kept
}
