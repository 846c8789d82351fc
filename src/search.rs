use crate::config::{FallbackStrategy, SearchSettings};
use crate::error::{ErrorKind, MailError};
use crate::graph::MailGateway;
use crate::models::{Folder, Message, strip_tags};
use crate::sync::{EventSink, MailEvent, Synchronizer, sort_newest_first};
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchPhase {
    #[default]
    Idle,
    Debouncing,
    Searching,
    /// The server refused the query; answering it another way.
    Fallback,
    Results,
}

#[derive(Debug, Clone, Default)]
pub struct SearchSnapshot {
    pub query: String,
    pub all_folders: bool,
    pub phase: SearchPhase,
    pub results: Vec<Message>,
}

impl SearchSnapshot {
    pub fn is_active(&self) -> bool {
        !self.query.trim().is_empty()
    }
}

#[derive(Default)]
struct SearchState {
    query: String,
    all_folders: bool,
    phase: SearchPhase,
    results: Vec<Message>,
    /// Identifies the latest issued query; older completions are dropped.
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl SearchState {
    fn cancel_pending(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

/// Case-insensitive match over subject, body, sender name and address.
pub fn matches_query(message: &Message, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    let body = match &message.body {
        Some(body) if !body.content.is_empty() => strip_tags(&body.content),
        _ => message.body_preview.clone().unwrap_or_default(),
    };
    let sender = message.sender();
    [
        message.subject.as_deref().unwrap_or_default(),
        body.as_str(),
        sender.and_then(|s| s.name.as_deref()).unwrap_or_default(),
        sender.and_then(|s| s.address.as_deref()).unwrap_or_default(),
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(&needle))
}

/// Debounced server search with a fallback for rejected queries.
#[derive(Clone)]
pub struct SearchCoordinator {
    state: Arc<Mutex<SearchState>>,
    gateway: Arc<dyn MailGateway>,
    sync: Synchronizer,
    events: EventSink,
    settings: SearchSettings,
}

impl SearchCoordinator {
    pub fn new(
        gateway: Arc<dyn MailGateway>,
        sync: Synchronizer,
        events: EventSink,
        settings: SearchSettings,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SearchState::default())),
            gateway,
            sync,
            events,
            settings,
        }
    }

    fn state(&self) -> MutexGuard<'_, SearchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MailEvent) {
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        let s = self.state();
        SearchSnapshot {
            query: s.query.clone(),
            all_folders: s.all_folders,
            phase: s.phase,
            results: s.results.clone(),
        }
    }

    /// Records a keystroke. The query runs once input has been quiet for
    /// the debounce delay; an empty query returns to idle at once.
    pub fn set_query(&self, query: &str) {
        let generation = {
            let mut s = self.state();
            s.cancel_pending();
            s.generation += 1;
            s.query = query.to_string();
            if query.trim().is_empty() {
                s.phase = SearchPhase::Idle;
                s.results.clear();
                None
            } else {
                s.phase = SearchPhase::Debouncing;
                Some(s.generation)
            }
        };

        let Some(generation) = generation else {
            self.sync.set_search_active(false);
            self.emit(MailEvent::SearchChanged);
            return;
        };
        self.sync.set_search_active(true);

        let this = self.clone();
        let delay = self.settings.debounce();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.run(generation).await;
        });
        {
            let mut s = self.state();
            if s.generation == generation {
                s.pending = Some(task);
            } else {
                task.abort();
            }
        }
        self.emit(MailEvent::SearchChanged);
    }

    /// Switches between the current folder and all folders. An active
    /// query is re-issued immediately.
    pub async fn set_all_folders(&self, all_folders: bool) {
        let generation = {
            let mut s = self.state();
            if s.all_folders == all_folders {
                return;
            }
            s.all_folders = all_folders;
            if s.query.trim().is_empty() {
                None
            } else {
                s.cancel_pending();
                s.generation += 1;
                Some(s.generation)
            }
        };
        self.emit(MailEvent::SearchChanged);
        if let Some(generation) = generation {
            self.run(generation).await;
        }
    }

    /// Opens a search result through the synchronizer and mirrors the
    /// read flag into the result list.
    pub async fn open_message(&self, message: &Message) {
        if self.sync.open_message(message).await {
            self.mark_read_local(&message.id);
        }
    }

    pub fn mark_read_local(&self, id: &str) {
        {
            let mut s = self.state();
            let Some(result) = s.results.iter_mut().find(|m| m.id == id) else {
                return;
            };
            result.is_read = true;
        }
        self.emit(MailEvent::SearchChanged);
    }

    /// Leaves search mode: pending work is cancelled and the folder view
    /// shows again.
    pub fn clear(&self) {
        {
            let mut s = self.state();
            s.cancel_pending();
            s.generation += 1;
            s.query.clear();
            s.results.clear();
            s.all_folders = false;
            s.phase = SearchPhase::Idle;
        }
        self.sync.set_search_active(false);
        self.emit(MailEvent::SearchChanged);
    }

    async fn run(&self, generation: u64) {
        let folder = self.sync.current_folder();
        let (term, scope) = {
            let mut s = self.state();
            if s.generation != generation {
                return;
            }
            s.phase = SearchPhase::Searching;
            let scope = (!s.all_folders).then_some(folder);
            (s.query.trim().to_string(), scope)
        };
        self.emit(MailEvent::SearchChanged);
        debug!("searching {:?} in {:?}", term, scope);

        let outcome = match self
            .gateway
            .search(&term, scope, 0, self.settings.page_size)
            .await
        {
            Ok(found) => Ok(found),
            Err(e) if e.kind() == ErrorKind::QueryUnsupported => {
                info!("server rejected search ({}), using {:?} fallback", e, self.settings.fallback);
                {
                    let mut s = self.state();
                    if s.generation != generation {
                        return;
                    }
                    s.phase = SearchPhase::Fallback;
                }
                self.emit(MailEvent::SearchChanged);
                self.fallback(&term, scope).await.map_err(|e| {
                    warn!("fallback search failed: {}", e);
                    "Search is not available. Please try again or check your permissions."
                        .to_string()
                })
            }
            Err(e) => {
                warn!("search failed: {}", e);
                Err(e.user_message("search"))
            }
        };

        let notice = {
            let mut s = self.state();
            if s.generation != generation {
                debug!("discarding results for superseded query {:?}", term);
                return;
            }
            s.pending = None;
            s.phase = SearchPhase::Results;
            match outcome {
                Ok(mut results) => {
                    sort_newest_first(&mut results);
                    s.results = results;
                    None
                }
                Err(notice) => {
                    s.results.clear();
                    Some(notice)
                }
            }
        };
        self.emit(MailEvent::SearchChanged);
        if let Some(notice) = notice {
            self.emit(MailEvent::Notice(notice));
        }
    }

    async fn fallback(&self, term: &str, scope: Option<Folder>) -> Result<Vec<Message>, MailError> {
        match self.settings.fallback {
            FallbackStrategy::ServerFilter => {
                self.gateway
                    .search_filter_fallback(term, scope, 0, self.settings.page_size)
                    .await
            }
            FallbackStrategy::Client => {
                let corpus_size = self.settings.fallback_corpus;
                let corpus = match scope {
                    Some(folder) => self.gateway.list_folder_page(folder, 0, corpus_size).await?,
                    None => {
                        let pages = join_all(
                            Folder::SEARCHABLE
                                .iter()
                                .map(|folder| self.gateway.list_folder_page(*folder, 0, corpus_size)),
                        )
                        .await;
                        Folder::SEARCHABLE
                            .iter()
                            .zip(pages)
                            .flat_map(|(folder, page)| {
                                page.unwrap_or_else(|e| {
                                    warn!("skipping {} in fallback search: {}", folder, e);
                                    Vec::new()
                                })
                            })
                            .collect()
                    }
                };
                Ok(corpus
                    .into_iter()
                    .filter(|m| matches_query(m, term))
                    .collect())
            }
        }
    }
}
