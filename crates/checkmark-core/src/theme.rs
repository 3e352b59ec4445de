use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::storage::KvStore;

pub const THEME_KEY: &str = "theme";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn next(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }

    pub fn storage_value(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    pub fn palette(self) -> &'static Palette {
        match self {
            Self::Light => &LIGHT,
            Self::Dark => &DARK,
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_value())
    }
}

impl FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            other => Err(anyhow!("unknown theme '{other}'")),
        }
    }
}

/// Named colors for one theme, as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Palette {
    pub background: &'static str,
    pub text: &'static str,
    pub card: &'static str,
    pub border: &'static str,
    pub primary: &'static str,
    pub icon: &'static str,
    pub success: &'static str,
}

impl Palette {
    pub fn entries(&self) -> [(&'static str, &'static str); 7] {
        [
            ("background", self.background),
            ("text", self.text),
            ("card", self.card),
            ("border", self.border),
            ("primary", self.primary),
            ("icon", self.icon),
            ("success", self.success),
        ]
    }
}

static LIGHT: Palette = Palette {
    background: "#FFFFFF",
    text: "#11181C",
    card: "#F9F9F9",
    border: "#E0E0E0",
    primary: "#007AFF",
    icon: "#687076",
    success: "#34C759",
};

static DARK: Palette = Palette {
    background: "#151718",
    text: "#ECEDEE",
    card: "#1F2123",
    border: "#2C2F33",
    primary: "#0A84FF",
    icon: "#9BA1A6",
    success: "#30D158",
};

/// Holds the active theme. With `persist` off the theme lives in memory only
/// and every process starts at light.
pub struct ThemeProvider<S> {
    backend: S,
    persist: bool,
    state: watch::Sender<Theme>,
    writer: Mutex<()>,
}

impl<S: KvStore> ThemeProvider<S> {
    pub fn new(backend: S, persist: bool) -> Self {
        Self {
            backend,
            persist,
            state: watch::Sender::new(Theme::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn theme(&self) -> Theme {
        *self.state.borrow()
    }

    pub fn colors(&self) -> &'static Palette {
        self.theme().palette()
    }

    pub fn persists(&self) -> bool {
        self.persist
    }

    pub fn subscribe(&self) -> watch::Receiver<Theme> {
        self.state.subscribe()
    }

    /// Restores the stored theme. Anything missing or unreadable means light.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self) -> Theme {
        if !self.persist {
            return self.theme();
        }

        let _writer = self.writer.lock().await;
        let theme = match self.backend.get(THEME_KEY).await {
            Ok(Some(raw)) => raw.parse::<Theme>().unwrap_or_else(|err| {
                warn!(error = %err, "ignoring stored theme");
                Theme::default()
            }),
            Ok(None) => Theme::default(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed reading stored theme");
                Theme::default()
            }
        };

        self.state.send_replace(theme);
        debug!(%theme, "theme loaded");
        theme
    }

    pub async fn toggle_theme(&self) -> Theme {
        let _writer = self.writer.lock().await;
        let theme = self.theme().next();
        self.apply(theme).await;
        theme
    }

    pub async fn set_theme(&self, theme: Theme) {
        let _writer = self.writer.lock().await;
        self.apply(theme).await;
    }

    #[tracing::instrument(skip(self))]
    async fn apply(&self, theme: Theme) {
        self.state.send_replace(theme);
        info!(%theme, "theme changed");

        if !self.persist {
            return;
        }
        if let Err(err) = self.backend.set(THEME_KEY, theme.storage_value()).await {
            warn!(error = %format!("{err:#}"), "failed saving theme; change kept in memory only");
        }
    }
}
