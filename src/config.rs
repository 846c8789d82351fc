use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub graph: GraphSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub keybindings: Keybindings,
    #[serde(default)]
    pub signatures: Signatures,
}

/// Identity provider registration and API location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    pub client_id: String,
    pub tenant: String,
    pub base_url: String,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            tenant: "common".to_string(),
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub page_size: usize,
    pub refresh_interval_secs: u64,
    pub undo_window_secs: u64,
    pub notifications: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            refresh_interval_secs: 30,
            undo_window_secs: 5,
            notifications: true,
        }
    }
}

impl SyncSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn undo_window(&self) -> Duration {
        Duration::from_secs(self.undo_window_secs)
    }
}

/// How a search that the server rejects is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Fetch a bounded corpus and match it locally.
    #[default]
    Client,
    /// Ask the server again with an OData `$filter` expression.
    ServerFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub debounce_ms: u64,
    pub page_size: usize,
    pub fallback_corpus: usize,
    pub fallback: FallbackStrategy,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            page_size: 50,
            fallback_corpus: 100,
            fallback: FallbackStrategy::Client,
        }
    }
}

impl SearchSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Signatures {
    pub new_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Keybindings {
    pub next_panel: Vec<String>,
    pub prev_panel: Vec<String>,
    pub move_up: Vec<String>,
    pub move_down: Vec<String>,
    pub open: Vec<String>,
    pub new_message: Vec<String>,
    pub delete: Vec<String>,
    pub undo: Vec<String>,
    pub dismiss_undo: Vec<String>,
    pub refresh: Vec<String>,
    pub load_more: Vec<String>,
    pub search: Vec<String>,
    pub toggle_all_folders: Vec<String>,
    pub send_message: Vec<String>,
    pub quit: Vec<String>,
}

impl Default for Keybindings {
    fn default() -> Self {
        let keys = |ks: &[&str]| ks.iter().map(|k| k.to_string()).collect::<Vec<_>>();
        Self {
            next_panel: keys(&["l", "Right", "Tab"]),
            prev_panel: keys(&["h", "Left", "BackTab"]),
            move_up: keys(&["k", "Up"]),
            move_down: keys(&["j", "Down"]),
            open: keys(&["Enter", " "]),
            new_message: keys(&["n"]),
            delete: keys(&["Backspace", "d"]),
            undo: keys(&["u"]),
            dismiss_undo: keys(&["x"]),
            refresh: keys(&["r"]),
            load_more: keys(&["m"]),
            search: keys(&["/", "ctrl-f"]),
            toggle_all_folders: keys(&["ctrl-a"]),
            send_message: keys(&["ctrl-s"]),
            quit: keys(&["q"]),
        }
    }
}

pub fn parse_key_string(key_str: &str) -> (KeyCode, KeyModifiers) {
    // A bare "-" is a key on its own, not a separator.
    if key_str == "-" {
        return (KeyCode::Char('-'), KeyModifiers::empty());
    }

    let mut parts: Vec<&str> = key_str.split('-').collect();
    let mut modifiers = KeyModifiers::empty();

    let base_key_str = parts.pop().unwrap_or("");

    for part in parts {
        match part.to_lowercase().as_str() {
            "ctrl" => modifiers.insert(KeyModifiers::CONTROL),
            "alt" => modifiers.insert(KeyModifiers::ALT),
            "shift" => modifiers.insert(KeyModifiers::SHIFT),
            "cmd" | "command" | "super" => modifiers.insert(KeyModifiers::SUPER),
            "meta" => modifiers.insert(KeyModifiers::META),
            _ => {}
        }
    }

    let mut chars = base_key_str.chars();
    let code = match base_key_str {
        "Backspace" => KeyCode::Backspace,
        "Enter" => KeyCode::Enter,
        "Left" => KeyCode::Left,
        "Right" => KeyCode::Right,
        "Up" => KeyCode::Up,
        "Down" => KeyCode::Down,
        "Tab" => KeyCode::Tab,
        "BackTab" => KeyCode::BackTab,
        "Esc" => KeyCode::Esc,
        "PageDown" => KeyCode::PageDown,
        " " => KeyCode::Char(' '),
        _ => match (chars.next(), chars.next()) {
            (Some(c), None) => KeyCode::Char(c),
            _ => KeyCode::Null,
        },
    };

    (code, modifiers)
}

pub fn matches_key(event: KeyEvent, bindings: &[String]) -> bool {
    bindings.iter().any(|b| {
        let (code, modifiers) = parse_key_string(b);
        event.code == code && event.modifiers.contains(modifiers)
    })
}

impl Config {
    pub fn load() -> Self {
        match std::fs::read_to_string(SETTINGS_FILE) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(content: &str) -> Self {
        match toml::from_str(content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("ignoring malformed {}: {}", SETTINGS_FILE, e);
                Self::default()
            }
        }
    }
}
