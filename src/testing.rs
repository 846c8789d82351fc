//! In-memory doubles shared by the synchronizer, search and refresh tests.

use crate::config::{SearchSettings, SyncSettings};
use crate::error::MailError;
use crate::graph::MailGateway;
use crate::models::{
    Composition, EmailAddress, Folder, MailFolderInfo, Message, Recipient, UserProfile,
};
use crate::notify::Notifier;
use crate::sync::{EventSink, MailEvent, Synchronizer, sort_newest_first};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Polls spent inside a gated call, enough for a concurrent caller to
/// start and park its own request.
const YIELD_ROUNDS: usize = 5;

/// Message `id` received `ts` seconds after the epoch. Subject and sender
/// name are both `id`.
pub fn msg(id: &str, ts: i64) -> Message {
    Message {
        id: id.to_string(),
        subject: Some(id.to_string()),
        body_preview: Some(format!("preview of {}", id)),
        from: Some(Recipient {
            email_address: EmailAddress {
                name: Some(id.to_string()),
                address: Some(format!("{}@example.com", id.to_lowercase())),
            },
        }),
        received_date_time: Utc.timestamp_opt(ts, 0).single(),
        is_read: true,
        ..Default::default()
    }
}

pub fn api_error(status: u16, message: &str) -> MailError {
    MailError::Api {
        status,
        message: message.to_string(),
    }
}

#[derive(Default)]
struct MockState {
    folders: HashMap<Folder, Vec<Message>>,
    failures: HashMap<&'static str, VecDeque<MailError>>,
    calls: HashMap<&'static str, usize>,
    searches: Vec<(String, Option<Folder>)>,
    next_id: u64,
    move_delay: Duration,
}

impl MockState {
    fn enter(&mut self, op: &'static str) -> Result<(), MailError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn locate(&self, id: &str) -> Option<(Folder, usize)> {
        self.folders.iter().find_map(|(folder, messages)| {
            messages
                .iter()
                .position(|m| m.id == id)
                .map(|index| (*folder, index))
        })
    }

    fn newest_first(&self, scope: Option<Folder>) -> Vec<Message> {
        let mut all: Vec<Message> = self
            .folders
            .iter()
            .filter(|(folder, _)| scope.is_none_or(|s| s == **folder))
            .flat_map(|(_, messages)| messages.iter().cloned())
            .collect();
        sort_newest_first(&mut all);
        all
    }
}

fn not_found() -> MailError {
    api_error(404, "The specified object was not found in the store.")
}

fn window(messages: Vec<Message>, skip: usize, top: usize) -> Vec<Message> {
    messages.into_iter().skip(skip).take(top).collect()
}

/// A mailbox server kept in memory. Moves assign new ids like the real one.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
    gated: AtomicBool,
}

impl MockGateway {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    async fn pause(&self) {
        if self.gated.load(Ordering::SeqCst) {
            for _ in 0..YIELD_ROUNDS {
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn put(&self, folder: Folder, messages: Vec<Message>) {
        self.lock()
            .folders
            .entry(folder)
            .or_default()
            .extend(messages);
    }

    pub fn remove(&self, id: &str) {
        let mut state = self.lock();
        if let Some((folder, index)) = state.locate(id) {
            state.folders.get_mut(&folder).unwrap().remove(index);
        }
    }

    pub fn folder_ids(&self, folder: Folder) -> Vec<String> {
        self.lock()
            .newest_first(Some(folder))
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    /// Makes reads suspend for a few polls before answering.
    pub fn set_yield(&self, on: bool) {
        self.gated.store(on, Ordering::SeqCst);
    }

    /// Makes moves take `delay` before the server applies them.
    pub fn set_move_delay(&self, delay: Duration) {
        self.lock().move_delay = delay;
    }

    pub fn fail_next(&self, op: &'static str, error: MailError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn searches(&self) -> Vec<(String, Option<Folder>)> {
        self.lock().searches.clone()
    }
}

#[async_trait]
impl MailGateway for MockGateway {
    async fn list_folder_page(
        &self,
        folder: Folder,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError> {
        self.lock().enter("list")?;
        self.pause().await;
        Ok(window(self.lock().newest_first(Some(folder)), skip, top))
    }

    async fn get_message(&self, id: &str) -> Result<Message, MailError> {
        let mut state = self.lock();
        state.enter("get")?;
        let (folder, index) = state.locate(id).ok_or_else(not_found)?;
        Ok(state.folders[&folder][index].clone())
    }

    async fn send_message(&self, composition: &Composition) -> Result<(), MailError> {
        let mut state = self.lock();
        state.enter("send")?;
        state.next_id += 1;
        let sent = Message {
            id: format!("sent-{}", state.next_id),
            subject: Some(composition.subject.clone()),
            sent_date_time: Some(Utc::now()),
            ..Default::default()
        };
        state.folders.entry(Folder::Sent).or_default().push(sent);
        Ok(())
    }

    async fn set_read(&self, id: &str, is_read: bool) -> Result<(), MailError> {
        let mut state = self.lock();
        state.enter("set_read")?;
        let (folder, index) = state.locate(id).ok_or_else(not_found)?;
        state.folders.get_mut(&folder).unwrap()[index].is_read = is_read;
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> Result<(), MailError> {
        let mut state = self.lock();
        state.enter("delete")?;
        let (folder, index) = state.locate(id).ok_or_else(not_found)?;
        state.folders.get_mut(&folder).unwrap().remove(index);
        Ok(())
    }

    async fn move_message(
        &self,
        id: &str,
        destination: Folder,
    ) -> Result<Option<Message>, MailError> {
        let delay = {
            let mut state = self.lock();
            state.enter("move")?;
            state.move_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        let (folder, index) = state.locate(id).ok_or_else(not_found)?;
        let mut moved = state.folders.get_mut(&folder).unwrap().remove(index);
        state.next_id += 1;
        moved.id = format!("{}~{}", moved.id, state.next_id);
        state
            .folders
            .entry(destination)
            .or_default()
            .push(moved.clone());
        Ok(Some(moved))
    }

    async fn search(
        &self,
        term: &str,
        scope: Option<Folder>,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError> {
        {
            let mut state = self.lock();
            state.searches.push((term.to_string(), scope));
            state.enter("search")?;
        }
        self.pause().await;
        let needle = term.to_lowercase();
        let found = self
            .lock()
            .newest_first(scope)
            .into_iter()
            .filter(|m| m.subject_or_default().to_lowercase().contains(&needle))
            .collect();
        Ok(window(found, skip, top))
    }

    async fn search_filter_fallback(
        &self,
        term: &str,
        scope: Option<Folder>,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError> {
        let mut state = self.lock();
        state.enter("filter")?;
        let found = state
            .newest_first(scope)
            .into_iter()
            .filter(|m| m.subject_or_default().contains(term))
            .collect();
        Ok(window(found, skip, top))
    }

    async fn list_folders(&self) -> Result<Vec<MailFolderInfo>, MailError> {
        let mut state = self.lock();
        state.enter("folders")?;
        Ok(Folder::ALL
            .iter()
            .map(|folder| {
                let messages = state.folders.get(folder).cloned().unwrap_or_default();
                MailFolderInfo {
                    id: folder.graph_id().to_string(),
                    display_name: folder.display_name().to_string(),
                    unread_item_count: messages.iter().filter(|m| !m.is_read).count() as u32,
                    total_item_count: messages.len() as u32,
                }
            })
            .collect())
    }

    async fn get_profile(&self) -> Result<UserProfile, MailError> {
        self.lock().enter("profile")?;
        Ok(UserProfile {
            display_name: Some("Test User".to_string()),
            mail: Some("test@example.com".to_string()),
            user_principal_name: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
    }
}

/// A synchronizer wired to the in-memory doubles.
pub struct Harness {
    pub sync: Synchronizer,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub sink: EventSink,
    pub events: mpsc::UnboundedReceiver<MailEvent>,
}

impl Harness {
    pub fn new(page_size: usize) -> Self {
        let gateway = Arc::new(MockGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let (sink, events) = mpsc::unbounded_channel();
        let settings = SyncSettings {
            page_size,
            ..Default::default()
        };
        let sync = Synchronizer::new(gateway.clone(), notifier.clone(), sink.clone(), settings);
        Self {
            sync,
            gateway,
            notifier,
            sink,
            events,
        }
    }

    pub fn search_settings() -> SearchSettings {
        SearchSettings::default()
    }

    /// Drains pending events and returns the notices among them.
    pub fn notices(&mut self) -> Vec<String> {
        let mut notices = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let MailEvent::Notice(text) = event {
                notices.push(text);
            }
        }
        notices
    }
}
