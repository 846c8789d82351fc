mod auth;
mod config;
mod error;
mod graph;
mod models;
mod notify;
mod refresh;
mod search;
mod sync;
#[cfg(test)]
mod testing;
mod ui;
mod undo;

use crate::auth::{Authenticator, CredentialProvider};
use crate::config::{Config, Keybindings, matches_key};
use crate::error::MailError;
use crate::graph::{GraphClient, MailGateway};
use crate::models::{Folder, MailFolderInfo};
use crate::notify::DesktopNotifier;
use crate::refresh::AutoRefresh;
use crate::search::SearchCoordinator;
use crate::sync::{MailEvent, Synchronizer};
use crate::ui::{ComposeState, FocusedPanel, UIMode, UIState};
use anyhow::Context;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode},
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEBUG_LOG_FILE: &str = "otui_debug.log";

/// Installs a file logger when `--debug` is given. Without it nothing is
/// installed: stdout belongs to the terminal UI.
fn init_tracing(debug: bool) -> anyhow::Result<()> {
    if !debug {
        return Ok(());
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(DEBUG_LOG_FILE)
        .with_context(|| format!("Failed to open {}", DEBUG_LOG_FILE))?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("otui=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .init();
    Ok(())
}

/// Core handles, available once sign-in completed.
#[derive(Clone)]
struct Services {
    gateway: Arc<dyn MailGateway>,
    sync: Synchronizer,
    search: SearchCoordinator,
}

/// Runs `task` detached; its failure has already been logged and surfaced
/// by the core.
fn detach<T, F>(task: F)
where
    F: Future<Output = Result<T, MailError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            debug!("background action ended with error: {}", e);
        }
    });
}

struct App<'a> {
    config: Config,
    keys: Keybindings,
    ui: UIState<'a>,
    authenticator: Authenticator,
    services: Option<Services>,
    auto_refresh: Option<AutoRefresh>,
    url_rx: mpsc::Receiver<String>,
    auth_rx: mpsc::Receiver<Result<(), MailError>>,
    event_tx: mpsc::UnboundedSender<MailEvent>,
    event_rx: mpsc::UnboundedReceiver<MailEvent>,
    folders_tx: mpsc::Sender<Vec<MailFolderInfo>>,
    folders_rx: mpsc::Receiver<Vec<MailFolderInfo>>,
    profile_tx: mpsc::Sender<String>,
    profile_rx: mpsc::Receiver<String>,
}

impl<'a> App<'a> {
    fn new(config: Config, authenticator: Authenticator, url_rx: mpsc::Receiver<String>) -> Self {
        let (auth_tx, auth_rx) = mpsc::channel(1);
        let signer = authenticator.clone();
        tokio::spawn(async move {
            let result = signer.acquire_token().await.map(|_| ());
            let _ = auth_tx.send(result).await;
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (folders_tx, folders_rx) = mpsc::channel(4);
        let (profile_tx, profile_rx) = mpsc::channel(1);
        Self {
            keys: config.keybindings.clone(),
            config,
            ui: UIState::default(),
            authenticator,
            services: None,
            auto_refresh: None,
            url_rx,
            auth_rx,
            event_tx,
            event_rx,
            folders_tx,
            folders_rx,
            profile_tx,
            profile_rx,
        }
    }

    /// Wires the gateway, synchronizer and search coordinator together and
    /// starts loading the inbox.
    fn start_services(&mut self) -> anyhow::Result<()> {
        let gateway: Arc<dyn MailGateway> = Arc::new(
            GraphClient::new(
                &self.config.graph.base_url,
                Arc::new(self.authenticator.clone()),
            )
            .context("Failed to load native TLS roots")?,
        );
        let notifier = Arc::new(DesktopNotifier::probe(self.config.sync.notifications));
        let sync = Synchronizer::new(
            gateway.clone(),
            notifier,
            self.event_tx.clone(),
            self.config.sync.clone(),
        );
        let search = SearchCoordinator::new(
            gateway.clone(),
            sync.clone(),
            self.event_tx.clone(),
            self.config.search.clone(),
        );
        self.auto_refresh = Some(AutoRefresh::start(
            sync.clone(),
            self.config.sync.refresh_interval(),
        ));

        let services = Services {
            gateway,
            sync,
            search,
        };

        let profile_tx = self.profile_tx.clone();
        let profile_gateway = services.gateway.clone();
        tokio::spawn(async move {
            match profile_gateway.get_profile().await {
                Ok(profile) => {
                    let _ = profile_tx.send(profile.label()).await;
                }
                Err(e) => tracing::warn!("failed to load profile: {}", e),
            }
        });

        let sync = services.sync.clone();
        detach(async move { sync.open_folder(Folder::Inbox).await });
        self.services = Some(services);
        self.reload_folders();
        Ok(())
    }

    fn reload_folders(&self) {
        let Some(services) = &self.services else {
            return;
        };
        let gateway = services.gateway.clone();
        let tx = self.folders_tx.clone();
        tokio::spawn(async move {
            match gateway.list_folders().await {
                Ok(folders) => {
                    let _ = tx.send(folders).await;
                }
                Err(e) => tracing::warn!("failed to load folders: {}", e),
            }
        });
    }

    /// Pulls pending signals from auth and the core into the UI state.
    fn drain_channels(&mut self) -> anyhow::Result<()> {
        while let Ok(url) = self.url_rx.try_recv() {
            self.ui.auth_url = Some(url);
            self.ui.mode = UIMode::Authentication;
        }

        if self.services.is_none() {
            if let Ok(result) = self.auth_rx.try_recv() {
                result.map_err(|e| anyhow::anyhow!("Sign-in failed: {}", e))?;
                info!("signed in");
                self.ui.mode = UIMode::Browsing;
                self.ui.auth_url = None;
                self.start_services()?;
            }
        }

        while let Ok(folders) = self.folders_rx.try_recv() {
            self.ui.folders = folders;
        }
        while let Ok(profile) = self.profile_rx.try_recv() {
            self.ui.profile = Some(profile);
        }

        let (mut mailbox_dirty, mut search_dirty) = (false, false);
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                MailEvent::MailboxChanged => mailbox_dirty = true,
                MailEvent::SearchChanged => search_dirty = true,
                MailEvent::Notice(text) => self.ui.notice = Some(text),
            }
        }
        if let Some(services) = &self.services {
            if mailbox_dirty {
                self.ui.mailbox = services.sync.snapshot();
            }
            if search_dirty {
                self.ui.search = services.search.snapshot();
            }
        }
        self.ui.clamp_cursor();
        Ok(())
    }

    async fn run(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    ) -> anyhow::Result<()> {
        loop {
            self.drain_channels()?;
            terminal.draw(|f| ui::render(f, &mut self.ui))?;

            if !event::poll(Duration::from_millis(100))? {
                continue;
            }

            match event::read()? {
                Event::FocusGained => {
                    if let Some(refresher) = &self.auto_refresh {
                        refresher.focus_gained();
                    }
                }
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if self.handle_key(key) {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    /// Returns true when the user asked to quit.
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if self.ui.notice.take().is_some() {
            return false;
        }
        match self.ui.mode {
            UIMode::Authentication => key.code == KeyCode::Char('q'),
            UIMode::Browsing => self.handle_browsing_key(key),
            UIMode::Searching => {
                self.handle_search_key(key);
                false
            }
            UIMode::Composing => {
                self.handle_compose_key(key);
                false
            }
        }
    }

    fn switch_folder(&mut self, index: usize) {
        let Some(services) = self.services.clone() else {
            return;
        };
        let Some(folder) = Folder::ALL.get(index).copied() else {
            return;
        };
        self.ui.selected_folder_index = index;
        self.ui.cursor = 0;
        self.ui.detail_scroll = 0;
        self.ui.search_input.clear();
        services.search.clear();
        detach(async move { services.sync.open_folder(folder).await });
        self.reload_folders();
    }

    fn handle_browsing_key(&mut self, key: KeyEvent) -> bool {
        let Some(services) = self.services.clone() else {
            return matches_key(key, &self.keys.quit);
        };
        let keys = &self.keys;

        if matches_key(key, &keys.quit) {
            return true;
        }

        if key.code == KeyCode::Esc && self.ui.search.is_active() {
            services.search.clear();
            self.ui.search_input.clear();
            self.ui.cursor = 0;
        } else if matches_key(key, &keys.prev_panel) {
            self.ui.focused_panel = match self.ui.focused_panel {
                FocusedPanel::Details => FocusedPanel::Messages,
                FocusedPanel::Messages | FocusedPanel::Folders => FocusedPanel::Folders,
            };
        } else if matches_key(key, &keys.next_panel) {
            self.ui.focused_panel = match self.ui.focused_panel {
                FocusedPanel::Folders => FocusedPanel::Messages,
                FocusedPanel::Messages | FocusedPanel::Details => FocusedPanel::Details,
            };
        } else if matches_key(key, &keys.move_down) {
            match self.ui.focused_panel {
                FocusedPanel::Folders => {
                    if self.ui.selected_folder_index + 1 < Folder::ALL.len() {
                        self.switch_folder(self.ui.selected_folder_index + 1);
                    }
                }
                FocusedPanel::Messages => {
                    let len = self.ui.visible_messages().len();
                    if self.ui.cursor + 1 < len {
                        self.ui.cursor += 1;
                        self.ui.detail_scroll = 0;
                    }
                    // Prefetch when the cursor nears the end of the folder view.
                    let near_end = self.ui.cursor + 5 >= len;
                    if near_end && !self.ui.search.is_active() && self.ui.mailbox.has_more {
                        let sync = services.sync.clone();
                        detach(async move { sync.load_more().await });
                    }
                }
                FocusedPanel::Details => {
                    self.ui.detail_scroll = self.ui.detail_scroll.saturating_add(1);
                }
            }
        } else if matches_key(key, &keys.move_up) {
            match self.ui.focused_panel {
                FocusedPanel::Folders => {
                    if self.ui.selected_folder_index > 0 {
                        self.switch_folder(self.ui.selected_folder_index - 1);
                    }
                }
                FocusedPanel::Messages => {
                    if self.ui.cursor > 0 {
                        self.ui.cursor -= 1;
                        self.ui.detail_scroll = 0;
                    }
                }
                FocusedPanel::Details => {
                    self.ui.detail_scroll = self.ui.detail_scroll.saturating_sub(1);
                }
            }
        } else if matches_key(key, &keys.open) {
            match self.ui.focused_panel {
                FocusedPanel::Folders => self.ui.focused_panel = FocusedPanel::Messages,
                _ => {
                    if let Some(message) = self.ui.highlighted().cloned() {
                        self.ui.detail_scroll = 0;
                        let search = services.search.clone();
                        tokio::spawn(async move { search.open_message(&message).await });
                    }
                }
            }
        } else if matches_key(key, &keys.delete) {
            if self.ui.search.is_active() {
                self.ui.status_message = Some("Clear the search to delete".to_string());
            } else if let Some(id) = self.ui.highlighted().map(|m| m.id.clone()) {
                self.ui.status_message = None;
                let sync = services.sync.clone();
                detach(async move { sync.delete_message(&id).await });
            }
        } else if matches_key(key, &keys.undo) {
            let sync = services.sync.clone();
            detach(async move { sync.restore_message().await });
        } else if matches_key(key, &keys.dismiss_undo) {
            services.sync.dismiss_undo();
        } else if matches_key(key, &keys.refresh) {
            self.ui.cursor = 0;
            self.ui.detail_scroll = 0;
            let sync = services.sync.clone();
            detach(async move { sync.refresh().await });
            self.reload_folders();
        } else if matches_key(key, &keys.load_more) {
            let sync = services.sync.clone();
            detach(async move { sync.load_more().await });
        } else if matches_key(key, &keys.search) {
            self.ui.search_input = self.ui.search.query.clone();
            self.ui.mode = UIMode::Searching;
        } else if matches_key(key, &keys.toggle_all_folders) {
            let all = !self.ui.search.all_folders;
            tokio::spawn(async move { services.search.set_all_folders(all).await });
        } else if matches_key(key, &keys.new_message) {
            let mut body = String::new();
            if let Some(sig) = &self.config.signatures.new_message {
                body.push_str("\n\n--\n");
                body.push_str(sig);
            }
            self.ui.compose_state = Some(ComposeState::new(&body));
            self.ui.mode = UIMode::Composing;
            let _ = execute!(io::stdout(), crossterm::cursor::Show);
        }
        false
    }

    fn handle_search_key(&mut self, key: KeyEvent) {
        let Some(services) = self.services.clone() else {
            return;
        };
        if matches_key(key, &self.keys.toggle_all_folders) {
            let all = !self.ui.search.all_folders;
            tokio::spawn(async move { services.search.set_all_folders(all).await });
            return;
        }
        match key.code {
            KeyCode::Esc => {
                services.search.clear();
                self.ui.search_input.clear();
                self.ui.cursor = 0;
                self.ui.mode = UIMode::Browsing;
            }
            KeyCode::Enter => {
                self.ui.mode = UIMode::Browsing;
                self.ui.focused_panel = FocusedPanel::Messages;
            }
            KeyCode::Backspace => {
                self.ui.search_input.pop();
                self.ui.cursor = 0;
                services.search.set_query(&self.ui.search_input);
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.ui.search_input.push(c);
                self.ui.cursor = 0;
                services.search.set_query(&self.ui.search_input);
            }
            _ => {}
        }
    }

    fn close_compose(&mut self) {
        self.ui.mode = UIMode::Browsing;
        self.ui.compose_state = None;
        let _ = execute!(io::stdout(), crossterm::cursor::Hide);
    }

    fn handle_compose_key(&mut self, key: KeyEvent) {
        if key.code == KeyCode::Esc {
            self.close_compose();
            return;
        }
        if matches_key(key, &self.keys.send_message) {
            let Some(composition) = self.ui.compose_state.as_ref().map(|cs| cs.to_composition())
            else {
                return;
            };
            if composition.to.trim().is_empty() {
                self.ui.notice = Some("Please add at least one recipient.".to_string());
                return;
            }
            if let Some(services) = self.services.clone() {
                detach(async move { services.sync.send_message(&composition).await });
            }
            self.close_compose();
            return;
        }

        let Some(cs) = &mut self.ui.compose_state else {
            return;
        };
        match key.code {
            KeyCode::Char('b') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                cs.toggle_cc_bcc();
            }
            KeyCode::Tab => cs.next_field(),
            KeyCode::BackTab => cs.prev_field(),
            KeyCode::Enter if cs.focused_field != ui::ComposeField::Body => cs.next_field(),
            _ => {
                cs.focused_textarea().input(key);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    init_tracing(debug_logging)?;
    let config = Config::load();

    if std::env::args().any(|arg| arg == "--reset-token") {
        auth::RingStorage.clear_token().await?;
        println!("Token cleared. Please restart without --reset-token to re-authenticate.");
        return Ok(());
    }

    let (url_tx, url_rx) = mpsc::channel::<String>(1);
    let authenticator = Authenticator::build(&config.graph, auth::TuiDelegate { tx: url_tx }).await?;
    let mut app = App::new(config, authenticator, url_rx);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(
        stdout,
        crossterm::terminal::EnterAlternateScreen,
        crossterm::event::EnableMouseCapture,
        crossterm::event::EnableFocusChange
    )?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = app.run(&mut terminal).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen,
        crossterm::event::DisableMouseCapture,
        crossterm::event::DisableFocusChange
    )?;
    terminal.show_cursor()?;

    result
}
