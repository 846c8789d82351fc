use crate::config::SyncSettings;
use crate::error::{ErrorKind, MailError};
use crate::graph::MailGateway;
use crate::models::{Composition, Folder, Message};
use crate::notify::{Notifier, new_mail_summary};
use crate::undo::{UndoRecord, UndoSlot};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Signals from the core to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailEvent {
    MailboxChanged,
    SearchChanged,
    /// Blocking, user-visible message from a failed write.
    Notice(String),
}

pub type EventSink = mpsc::UnboundedSender<MailEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Initial,
    Append,
    ForceRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { arrived: usize, removed: usize },
    Appended(usize),
    /// Guard refused: another load is in flight, nothing more to page, or
    /// a background refresh does not apply right now.
    Skipped,
    /// The folder was switched while the request was in flight.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { undoable: bool },
    /// The server no longer had the message; the local removal stands.
    AlreadyGone,
    NotInView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    AlreadyGone,
    NothingToRestore,
}

/// One folder's in-memory list and pagination position.
#[derive(Debug, Clone)]
pub struct FolderView {
    pub folder: Folder,
    pub messages: Vec<Message>,
    /// How many server items the list accounts for; the next page's `skip`.
    pub cursor: usize,
    pub has_more: bool,
}

impl FolderView {
    fn new(folder: Folder) -> Self {
        Self {
            folder,
            messages: Vec::new(),
            cursor: 0,
            has_more: true,
        }
    }
}

/// Background refresh bookkeeping for one synchronizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshCursor {
    pub last_refresh: Option<DateTime<Utc>>,
    pub in_flight: bool,
}

#[derive(Debug)]
struct SyncState {
    view: FolderView,
    /// Bumped on every folder switch; responses tagged with an older epoch
    /// are dropped.
    epoch: u64,
    selected: Option<String>,
    loading: bool,
    loading_more: bool,
    refresh: RefreshCursor,
    unseen_new: u64,
    search_active: bool,
    undo: UndoSlot,
    /// List fetches started so far.
    fetches: u64,
    /// Ids removed locally by a delete: `None` while the remote call is in
    /// flight, then the fetch count at the moment it settled.
    deleting: HashMap<String, Option<u64>>,
}

impl SyncState {
    fn begin_fetch(&mut self) -> u64 {
        self.fetches += 1;
        self.fetches
    }

    /// Drops from `page` every message whose delete was still unsettled
    /// when the fetch numbered `started` began.
    fn strip_deleting(&mut self, page: &mut Vec<Message>, started: u64) {
        self.deleting
            .retain(|_, settled| settled.is_none_or(|at| at >= started));
        page.retain(|m| !self.deleting.contains_key(&m.id));
    }

    fn settle_delete(&mut self, id: &str) {
        let at = self.fetches;
        self.deleting.insert(id.to_string(), Some(at));
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            view: FolderView::new(Folder::Inbox),
            epoch: 0,
            selected: None,
            loading: false,
            loading_more: false,
            refresh: RefreshCursor::default(),
            unseen_new: 0,
            search_active: false,
            undo: UndoSlot::default(),
            fetches: 0,
            deleting: HashMap::new(),
        }
    }
}

/// Read-only copy of the synchronizer state for rendering.
#[derive(Debug, Clone, Default)]
pub struct MailboxSnapshot {
    pub folder: Folder,
    pub messages: Vec<Message>,
    pub cursor: usize,
    pub has_more: bool,
    pub selected: Option<String>,
    pub loading: bool,
    pub loading_more: bool,
    pub refreshing: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub unseen_new: u64,
    pub undo: Option<UndoRecord>,
}

impl MailboxSnapshot {
    pub fn selected_message(&self) -> Option<&Message> {
        let id = self.selected.as_deref()?;
        self.messages.iter().find(|m| m.id == id)
    }
}

/// Result of merging a freshly fetched first page into the local list.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub messages: Vec<Message>,
    pub arrived: Vec<Message>,
    pub removed: Vec<String>,
}

pub fn sort_newest_first(messages: &mut [Message]) {
    messages.sort_by_key(|m| std::cmp::Reverse(m.timestamp()));
}

/// Inserts `message` at its timestamp position.
pub fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let ts = message.timestamp();
    let pos = messages
        .iter()
        .position(|m| m.timestamp() < ts)
        .unwrap_or(messages.len());
    messages.insert(pos, message);
}

/// Appends the unseen part of `page` and returns how many were new.
pub fn merge_append(existing: &mut Vec<Message>, page: Vec<Message>) -> usize {
    let mut seen: HashSet<String> = existing.iter().map(|m| m.id.clone()).collect();
    let before = existing.len();
    for message in page {
        if seen.insert(message.id.clone()) {
            existing.push(message);
        }
    }
    sort_newest_first(existing);
    existing.len() - before
}

/// Reconciles `fetched` (the first page, authoritative) against `previous`.
///
/// Messages missing from the page are treated as removed elsewhere. With
/// `retain_older`, messages older than the page's oldest item are kept: the
/// server said nothing about them. The cost is that a message deleted
/// elsewhere below the first page stays listed until the next initial or
/// forced load.
pub fn reconcile(previous: &[Message], fetched: Vec<Message>, retain_older: bool) -> Reconciliation {
    let mut fetched_ids = HashSet::new();
    let mut messages: Vec<Message> = fetched
        .into_iter()
        .filter(|m| fetched_ids.insert(m.id.clone()))
        .collect();

    let previous_ids: HashSet<&str> = previous.iter().map(|m| m.id.as_str()).collect();
    let arrived = if previous.is_empty() {
        Vec::new()
    } else {
        messages
            .iter()
            .filter(|m| !previous_ids.contains(m.id.as_str()))
            .cloned()
            .collect()
    };

    let floor = messages.iter().map(Message::timestamp).min();
    let mut removed = Vec::new();
    for old in previous.iter().filter(|m| !fetched_ids.contains(&m.id)) {
        match floor {
            Some(floor) if retain_older && old.timestamp() < floor => messages.push(old.clone()),
            _ => removed.push(old.id.clone()),
        }
    }

    sort_newest_first(&mut messages);
    Reconciliation {
        messages,
        arrived,
        removed,
    }
}

/// Owns the reconciled view of the current folder.
///
/// Clones share state; the mutex is never held across an await, so every
/// guard flag is checked and set within a single cooperative step.
#[derive(Clone)]
pub struct Synchronizer {
    state: Arc<Mutex<SyncState>>,
    gateway: Arc<dyn MailGateway>,
    notifier: Arc<dyn Notifier>,
    events: EventSink,
    settings: SyncSettings,
}

impl Synchronizer {
    pub fn new(
        gateway: Arc<dyn MailGateway>,
        notifier: Arc<dyn Notifier>,
        events: EventSink,
        settings: SyncSettings,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SyncState::default())),
            gateway,
            notifier,
            events,
            settings,
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MailEvent) {
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> MailboxSnapshot {
        let s = self.state();
        MailboxSnapshot {
            folder: s.view.folder,
            messages: s.view.messages.clone(),
            cursor: s.view.cursor,
            has_more: s.view.has_more,
            selected: s.selected.clone(),
            loading: s.loading,
            loading_more: s.loading_more,
            refreshing: s.refresh.in_flight,
            last_refresh: s.refresh.last_refresh,
            unseen_new: s.unseen_new,
            undo: s.undo.current().cloned(),
        }
    }

    pub fn current_folder(&self) -> Folder {
        self.state().view.folder
    }

    pub fn set_search_active(&self, active: bool) {
        self.state().search_active = active;
    }

    pub fn select(&self, id: Option<String>) {
        self.state().selected = id;
        self.emit(MailEvent::MailboxChanged);
    }

    /// Discards the current view and loads the first page of `folder`.
    pub async fn open_folder(&self, folder: Folder) -> Result<LoadOutcome, MailError> {
        {
            let mut s = self.state();
            s.epoch += 1;
            s.view = FolderView::new(folder);
            s.selected = None;
            s.unseen_new = 0;
            s.loading = false;
            s.loading_more = false;
            s.refresh.in_flight = false;
        }
        info!("switched to folder {}", folder);
        self.emit(MailEvent::MailboxChanged);
        self.load_folder(LoadMode::Initial).await
    }

    /// User-requested refresh: resets the badge and selection, then reloads
    /// the first page.
    pub async fn refresh(&self) -> Result<LoadOutcome, MailError> {
        {
            let mut s = self.state();
            s.unseen_new = 0;
            s.selected = None;
        }
        self.load_folder(LoadMode::ForceRefresh).await
    }

    pub async fn load_more(&self) -> Result<LoadOutcome, MailError> {
        self.load_folder(LoadMode::Append).await
    }

    pub async fn load_folder(&self, mode: LoadMode) -> Result<LoadOutcome, MailError> {
        let (folder, epoch, skip, started) = {
            let mut s = self.state();
            let busy = s.loading || s.refresh.in_flight;
            let skip = match mode {
                LoadMode::Append => {
                    if busy || s.loading_more || !s.view.has_more {
                        return Ok(LoadOutcome::Skipped);
                    }
                    s.loading_more = true;
                    s.view.cursor
                }
                LoadMode::Initial | LoadMode::ForceRefresh => {
                    if busy {
                        return Ok(LoadOutcome::Skipped);
                    }
                    s.loading = true;
                    0
                }
            };
            let started = s.begin_fetch();
            (s.view.folder, s.epoch, skip, started)
        };
        self.emit(MailEvent::MailboxChanged);

        let page_size = self.settings.page_size;
        let result = self.gateway.list_folder_page(folder, skip, page_size).await;

        let (outcome, arrived) = {
            let mut s = self.state();
            if s.epoch != epoch {
                debug!("dropping {:?} load of {}: folder switched", mode, folder);
                return Ok(LoadOutcome::Stale);
            }
            match mode {
                LoadMode::Append => s.loading_more = false,
                _ => s.loading = false,
            }

            let mut page = match result {
                Ok(page) => page,
                Err(e) => {
                    drop(s);
                    warn!("failed to load {} at skip {}: {}", folder, skip, e);
                    self.emit(MailEvent::MailboxChanged);
                    return Err(e);
                }
            };

            s.view.has_more = page.len() == page_size;
            s.strip_deleting(&mut page, started);
            match mode {
                LoadMode::Append => {
                    let added = merge_append(&mut s.view.messages, page);
                    s.view.cursor += added;
                    debug!("{}: appended {} (cursor {})", folder, added, s.view.cursor);
                    (LoadOutcome::Appended(added), Vec::new())
                }
                LoadMode::Initial | LoadMode::ForceRefresh => {
                    let rec = reconcile(&s.view.messages, page, false);
                    let outcome = self.apply(&mut s, rec.messages, &rec.removed, rec.arrived.len());
                    (outcome, rec.arrived)
                }
            }
        };

        self.announce(folder, &arrived);
        self.emit(MailEvent::MailboxChanged);
        Ok(outcome)
    }

    /// Periodic/focus refresh of the inbox's first page.
    pub async fn background_refresh(&self) -> Result<LoadOutcome, MailError> {
        let (epoch, started) = {
            let mut s = self.state();
            if s.view.folder != Folder::Inbox
                || s.search_active
                || s.refresh.in_flight
                || s.loading
            {
                return Ok(LoadOutcome::Skipped);
            }
            s.refresh.in_flight = true;
            (s.epoch, s.begin_fetch())
        };
        self.emit(MailEvent::MailboxChanged);

        let page_size = self.settings.page_size;
        let result = self
            .gateway
            .list_folder_page(Folder::Inbox, 0, page_size)
            .await;

        let (outcome, arrived) = {
            let mut s = self.state();
            if s.epoch != epoch {
                return Ok(LoadOutcome::Stale);
            }
            s.refresh.in_flight = false;

            let mut page = match result {
                Ok(page) => page,
                Err(e) => {
                    drop(s);
                    warn!("background refresh failed: {}", e);
                    self.emit(MailEvent::MailboxChanged);
                    return Err(e);
                }
            };

            let full = page.len() == page_size;
            s.strip_deleting(&mut page, started);
            let fetched = page.len();
            let rec = reconcile(&s.view.messages, page, full);
            let kept_older = rec.messages.len() > fetched;
            s.view.has_more = full && (!kept_older || s.view.has_more);
            let outcome = self.apply(&mut s, rec.messages, &rec.removed, rec.arrived.len());
            (outcome, rec.arrived)
        };

        self.announce(Folder::Inbox, &arrived);
        self.emit(MailEvent::MailboxChanged);
        Ok(outcome)
    }

    /// Installs a reconciled list. Server copies always replace local ones.
    fn apply(
        &self,
        s: &mut SyncState,
        messages: Vec<Message>,
        removed: &[String],
        arrived: usize,
    ) -> LoadOutcome {
        if let Some(selected) = &s.selected {
            if removed.contains(selected) {
                s.selected = None;
            }
        }
        s.view.messages = messages;
        s.view.cursor = s.view.messages.len();
        s.unseen_new += arrived as u64;
        s.refresh.last_refresh = Some(Utc::now());
        LoadOutcome::Loaded {
            arrived,
            removed: removed.len(),
        }
    }

    fn announce(&self, folder: Folder, arrived: &[Message]) {
        if arrived.is_empty() || folder != Folder::Inbox {
            return;
        }
        info!("{} new message(s) in {}", arrived.len(), folder);
        let (title, body) = new_mail_summary(arrived);
        self.notifier.notify(&title, &body);
    }

    /// Selects `message`, fetches its latest copy and marks it read when it
    /// is unread. The message may come from search results rather than the
    /// folder view. Returns whether the server marked it read.
    pub async fn open_message(&self, message: &Message) -> bool {
        let id = message.id.as_str();
        self.select(Some(id.to_string()));

        let mut unread = !message.is_read;
        match self.gateway.get_message(id).await {
            Ok(latest) => {
                unread = !latest.is_read;
                let mut s = self.state();
                if let Some(slot) = s.view.messages.iter_mut().find(|m| m.id == id) {
                    *slot = latest;
                }
            }
            Err(e) => warn!("failed to fetch message {}: {}", id, e),
        }
        self.emit(MailEvent::MailboxChanged);
        unread && self.mark_read(id).await
    }

    /// Marks `id` read on the server, then in the folder view if it is
    /// listed there. Failures are only logged.
    pub async fn mark_read(&self, id: &str) -> bool {
        let already_read = {
            let s = self.state();
            s.view.messages.iter().any(|m| m.id == id && m.is_read)
        };
        if already_read {
            return false;
        }

        match self.gateway.set_read(id, true).await {
            Ok(()) => {
                let mut s = self.state();
                if let Some(m) = s.view.messages.iter_mut().find(|m| m.id == id) {
                    m.is_read = true;
                }
                drop(s);
                self.emit(MailEvent::MailboxChanged);
                true
            }
            Err(e) => {
                warn!("failed to mark {} read: {}", id, e);
                false
            }
        }
    }

    /// Removes the message immediately, then deletes it remotely. Outside
    /// deleted items the delete is a move there, so the moved copy can be
    /// restored; inside deleted items it is permanent.
    pub async fn delete_message(&self, id: &str) -> Result<DeleteOutcome, MailError> {
        let (removed, folder, epoch) = {
            let mut s = self.state();
            let Some(index) = s.view.messages.iter().position(|m| m.id == id) else {
                return Ok(DeleteOutcome::NotInView);
            };
            let removed = s.view.messages.remove(index);
            if s.selected.as_deref() == Some(id) {
                s.selected = None;
            }
            s.view.cursor = s.view.cursor.saturating_sub(1);
            s.deleting.insert(id.to_string(), None);
            (removed, s.view.folder, s.epoch)
        };
        self.emit(MailEvent::MailboxChanged);

        let result = if folder == Folder::Deleted {
            self.gateway.delete_message(id).await.map(|()| None)
        } else {
            self.gateway
                .move_message(id, Folder::Deleted)
                .await
                .map(|moved| Some(moved.map(|m| m.id).unwrap_or_else(|| id.to_string())))
        };

        match result {
            Ok(Some(trashed_id)) => {
                let record = UndoRecord {
                    snapshot: removed,
                    trashed_id,
                    origin: folder,
                    deleted_at: Utc::now(),
                };
                let generation = {
                    let mut s = self.state();
                    s.settle_delete(id);
                    s.undo.arm(record)
                };
                self.start_undo_timer(generation);
                self.emit(MailEvent::MailboxChanged);
                Ok(DeleteOutcome::Deleted { undoable: true })
            }
            Ok(None) => {
                self.state().settle_delete(id);
                Ok(DeleteOutcome::Deleted { undoable: false })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} already gone on the server", id);
                self.state().settle_delete(id);
                Ok(DeleteOutcome::AlreadyGone)
            }
            Err(e) => {
                warn!("failed to delete {}: {}", id, e);
                {
                    let mut s = self.state();
                    s.deleting.remove(id);
                    if s.epoch == epoch && !s.view.messages.iter().any(|m| m.id == id) {
                        insert_sorted(&mut s.view.messages, removed);
                        s.view.cursor += 1;
                    }
                }
                self.emit(MailEvent::MailboxChanged);
                let mut notice = e.user_message("delete email");
                if e.kind() != ErrorKind::AuthorizationDenied {
                    notice.push_str(" The email has been restored.");
                }
                self.emit(MailEvent::Notice(notice));
                Err(e)
            }
        }
    }

    fn start_undo_timer(&self, generation: u64) {
        let this = self.clone();
        let window = self.settings.undo_window();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if this.state().undo.expire(generation) {
                debug!("undo window closed");
                this.emit(MailEvent::MailboxChanged);
            }
        });
        self.state()
            .undo
            .attach_timer(generation, timer.abort_handle());
    }

    /// Moves the last deleted message back to the folder it came from.
    pub async fn restore_message(&self) -> Result<RestoreOutcome, MailError> {
        let Some(record) = self.state().undo.take() else {
            return Ok(RestoreOutcome::NothingToRestore);
        };
        self.emit(MailEvent::MailboxChanged);

        match self
            .gateway
            .move_message(&record.trashed_id, record.origin)
            .await
        {
            Ok(moved) => {
                let restored = moved.unwrap_or_else(|| record.snapshot.clone());
                {
                    let mut s = self.state();
                    s.deleting.remove(&record.snapshot.id);
                    let present = s
                        .view
                        .messages
                        .iter()
                        .any(|m| m.id == restored.id || m.id == record.snapshot.id);
                    if s.view.folder == record.origin && !present {
                        insert_sorted(&mut s.view.messages, restored);
                        s.view.cursor += 1;
                    }
                }
                info!("restored message to {}", record.origin);
                self.emit(MailEvent::MailboxChanged);
                Ok(RestoreOutcome::Restored)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.emit(MailEvent::Notice(
                    "The email could not be restored. It may have been permanently deleted."
                        .to_string(),
                ));
                Ok(RestoreOutcome::AlreadyGone)
            }
            Err(e) => {
                warn!("failed to restore {}: {}", record.trashed_id, e);
                self.emit(MailEvent::Notice(e.user_message("restore email")));
                Err(e)
            }
        }
    }

    pub fn dismiss_undo(&self) {
        if self.state().undo.take().is_some() {
            self.emit(MailEvent::MailboxChanged);
        }
    }

    /// Sends a message and reloads the current folder so Sent shows it.
    pub async fn send_message(&self, composition: &Composition) -> Result<(), MailError> {
        if let Err(e) = self.gateway.send_message(composition).await {
            warn!("failed to send message: {}", e);
            self.emit(MailEvent::Notice(e.user_message("send email")));
            return Err(e);
        }
        info!("message sent");
        if let Err(e) = self.load_folder(LoadMode::ForceRefresh).await {
            debug!("post-send reload failed: {}", e);
        }
        Ok(())
    }
}
