use crate::models::{Composition, Folder, MailFolderInfo, Message};
use crate::search::{SearchPhase, SearchSnapshot};
use crate::sync::MailboxSnapshot;
use chrono::Local;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
};
use tui_textarea::TextArea;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum FocusedPanel {
    #[default]
    Folders,
    Messages,
    Details,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UIMode {
    Browsing,
    /// Keystrokes go to the search box.
    Searching,
    Composing,
    Authentication,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ComposeField {
    #[default]
    To,
    Cc,
    Bcc,
    Subject,
    Body,
}

pub struct ComposeState<'a> {
    pub to: TextArea<'a>,
    pub cc: TextArea<'a>,
    pub bcc: TextArea<'a>,
    pub subject: TextArea<'a>,
    pub body: TextArea<'a>,
    pub focused_field: ComposeField,
    pub show_cc_bcc: bool,
}

impl<'a> ComposeState<'a> {
    pub fn new(body: &str) -> Self {
        let mut fields = [
            TextArea::default(),
            TextArea::default(),
            TextArea::default(),
            TextArea::default(),
            TextArea::from(body.lines()),
        ];
        for field in fields.iter_mut() {
            field.set_cursor_line_style(Style::default());
        }
        let [to, cc, bcc, subject, body] = fields;

        Self {
            to,
            cc,
            bcc,
            subject,
            body,
            focused_field: ComposeField::To,
            show_cc_bcc: false,
        }
    }

    pub fn focused_textarea(&mut self) -> &mut TextArea<'a> {
        match self.focused_field {
            ComposeField::To => &mut self.to,
            ComposeField::Cc => &mut self.cc,
            ComposeField::Bcc => &mut self.bcc,
            ComposeField::Subject => &mut self.subject,
            ComposeField::Body => &mut self.body,
        }
    }

    pub fn next_field(&mut self) {
        self.focused_field = match self.focused_field {
            ComposeField::To if self.show_cc_bcc => ComposeField::Cc,
            ComposeField::To => ComposeField::Subject,
            ComposeField::Cc => ComposeField::Bcc,
            ComposeField::Bcc => ComposeField::Subject,
            ComposeField::Subject => ComposeField::Body,
            ComposeField::Body => ComposeField::To,
        };
    }

    pub fn prev_field(&mut self) {
        self.focused_field = match self.focused_field {
            ComposeField::To => ComposeField::Body,
            ComposeField::Cc => ComposeField::To,
            ComposeField::Bcc => ComposeField::Cc,
            ComposeField::Subject if self.show_cc_bcc => ComposeField::Bcc,
            ComposeField::Subject => ComposeField::To,
            ComposeField::Body => ComposeField::Subject,
        };
    }

    pub fn toggle_cc_bcc(&mut self) {
        self.show_cc_bcc = !self.show_cc_bcc;
        if !self.show_cc_bcc
            && matches!(self.focused_field, ComposeField::Cc | ComposeField::Bcc)
        {
            self.focused_field = ComposeField::To;
        }
    }

    pub fn to_composition(&self) -> Composition {
        let text = |area: &TextArea<'_>| area.lines().join("\n");
        Composition {
            to: text(&self.to),
            cc: text(&self.cc),
            bcc: text(&self.bcc),
            subject: text(&self.subject),
            body: text(&self.body),
        }
    }
}

pub struct UIState<'a> {
    pub mailbox: MailboxSnapshot,
    pub search: SearchSnapshot,
    pub folders: Vec<MailFolderInfo>,
    pub profile: Option<String>,
    pub selected_folder_index: usize,
    /// Highlighted row of the visible list.
    pub cursor: usize,
    pub messages_list_state: ListState,
    pub detail_scroll: u16,
    pub focused_panel: FocusedPanel,
    pub mode: UIMode,
    pub compose_state: Option<ComposeState<'a>>,
    pub search_input: String,
    pub auth_url: Option<String>,
    /// Blocking message; any key dismisses it.
    pub notice: Option<String>,
    pub status_message: Option<String>,
}

impl<'a> Default for UIState<'a> {
    fn default() -> Self {
        Self {
            mailbox: MailboxSnapshot::default(),
            search: SearchSnapshot::default(),
            folders: Vec::new(),
            profile: None,
            selected_folder_index: 0,
            cursor: 0,
            messages_list_state: ListState::default(),
            detail_scroll: 0,
            focused_panel: FocusedPanel::Messages,
            mode: UIMode::Authentication,
            compose_state: None,
            search_input: String::new(),
            auth_url: None,
            notice: None,
            status_message: None,
        }
    }
}

impl<'a> UIState<'a> {
    /// Search results while a query is active, otherwise the folder view.
    pub fn visible_messages(&self) -> &[Message] {
        if self.search.is_active() {
            &self.search.results
        } else {
            &self.mailbox.messages
        }
    }

    pub fn highlighted(&self) -> Option<&Message> {
        self.visible_messages().get(self.cursor)
    }

    pub fn selected_folder(&self) -> Folder {
        Folder::ALL
            .get(self.selected_folder_index)
            .copied()
            .unwrap_or_default()
    }

    /// Keeps the cursor inside the list after it shrank or grew.
    pub fn clamp_cursor(&mut self) {
        let len = self.visible_messages().len();
        if self.cursor >= len {
            self.cursor = len.saturating_sub(1);
        }
    }

    /// The message shown in the details pane.
    pub fn opened(&self) -> Option<&Message> {
        let id = self.mailbox.selected.as_deref()?;
        self.visible_messages()
            .iter()
            .find(|m| m.id == id)
            .or_else(|| self.mailbox.selected_message())
    }
}

/// Sidebar entry: display name plus unread count when there is one.
pub fn folder_label(folder: Folder, folders: &[MailFolderInfo]) -> String {
    let unread = folders
        .iter()
        .find(|f| Folder::from_graph_id(&f.id) == Some(folder) || f.display_name == folder.display_name())
        .map(|f| f.unread_item_count)
        .unwrap_or(0);
    if unread > 0 {
        format!("{} ({})", folder.display_name(), unread)
    } else {
        folder.display_name().to_string()
    }
}

/// Right-hand side of the header: refresh state and new-mail badge.
pub fn status_text(mailbox: &MailboxSnapshot) -> String {
    let mut parts = Vec::new();
    if mailbox.refreshing || mailbox.loading {
        parts.push("Refreshing…".to_string());
    } else if let Some(at) = mailbox.last_refresh {
        parts.push(format!(
            "Updated {}",
            at.with_timezone(&Local).format("%H:%M:%S")
        ));
    }
    if mailbox.unseen_new > 0 {
        parts.push(format!("{} new", mailbox.unseen_new));
    }
    parts.join(" | ")
}

pub fn search_title(search: &SearchSnapshot) -> String {
    let scope = if search.all_folders {
        "all folders"
    } else {
        "this folder"
    };
    let phase = match search.phase {
        SearchPhase::Idle => String::new(),
        SearchPhase::Debouncing | SearchPhase::Searching => " - searching…".to_string(),
        SearchPhase::Fallback => " - searching (fallback)…".to_string(),
        SearchPhase::Results => format!(" - {} result(s)", search.results.len()),
    };
    format!(" Search ({}){} ", scope, phase)
}

fn border_style(focused: bool) -> Style {
    if focused {
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Gray)
    }
}

pub fn render(f: &mut Frame, state: &mut UIState<'_>) {
    if let UIMode::Authentication = state.mode {
        render_authentication(f, state);
        return;
    }

    let show_search = state.mode == UIMode::Searching || state.search.is_active();
    let show_undo = state.mailbox.undo.is_some();
    let mut rows = vec![Constraint::Length(1)];
    if show_search {
        rows.push(Constraint::Length(3));
    }
    rows.push(Constraint::Min(5));
    if show_undo {
        rows.push(Constraint::Length(1));
    }
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(rows)
        .split(f.area());
    let mut row = 0;

    let header = format!(
        " {}   {}",
        state.profile.as_deref().unwrap_or("Signing in…"),
        status_text(&state.mailbox)
    );
    f.render_widget(
        Paragraph::new(header).style(Style::default().fg(Color::Cyan)),
        rows[row],
    );
    row += 1;

    if show_search {
        let search = Paragraph::new(state.search_input.as_str()).block(
            Block::default()
                .borders(Borders::ALL)
                .title(search_title(&state.search))
                .border_style(border_style(state.mode == UIMode::Searching)),
        );
        f.render_widget(search, rows[row]);
        if state.mode == UIMode::Searching {
            let x = rows[row].x + 1 + state.search_input.chars().count() as u16;
            f.set_cursor_position((x, rows[row].y + 1));
        }
        row += 1;
    }

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(15),
            Constraint::Percentage(35),
            Constraint::Percentage(50),
        ])
        .split(rows[row]);
    row += 1;

    render_folders(f, state, chunks[0]);
    render_messages(f, state, chunks[1]);
    render_details(f, state, chunks[2]);

    if let Some(record) = &state.mailbox.undo {
        let bar = Paragraph::new(format!(
            " {}   [u] Undo   [x] Dismiss",
            record.description()
        ))
        .style(Style::default().fg(Color::Black).bg(Color::Yellow));
        f.render_widget(bar, rows[row]);
    }

    if let UIMode::Composing = state.mode {
        if let Some(cs) = &mut state.compose_state {
            render_compose(f, cs);
        }
    }

    if let Some(notice) = &state.notice {
        let area = centered_rect(60, 30, f.area());
        f.render_widget(Clear, area);
        let popup = Paragraph::new(notice.as_str())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" Notice (press any key) ")
                    .border_style(Style::default().fg(Color::Red)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(popup, area);
    }
}

fn render_folders(f: &mut Frame, state: &UIState<'_>, area: Rect) {
    let items: Vec<ListItem> = Folder::ALL
        .iter()
        .enumerate()
        .map(|(i, folder)| {
            let style = if i == state.selected_folder_index {
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(folder_label(*folder, &state.folders)).style(style)
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title("Folders")
        .border_style(border_style(state.focused_panel == FocusedPanel::Folders));
    f.render_widget(List::new(items).block(block), area);
}

fn render_messages(f: &mut Frame, state: &mut UIState<'_>, area: Rect) {
    let list_width = area.width.saturating_sub(4) as usize;
    let title = match &state.status_message {
        Some(status) => format!("{} - {}", state.mailbox.folder.display_name(), status),
        None => state.mailbox.folder.display_name().to_string(),
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .border_style(border_style(state.focused_panel == FocusedPanel::Messages));

    let cursor = state.cursor;
    let messages = state.visible_messages();
    if messages.is_empty() {
        let text = if state.search.is_active() {
            match state.search.phase {
                SearchPhase::Results => "No results",
                _ => "Searching…",
            }
        } else if state.mailbox.loading {
            "Loading…"
        } else {
            "No messages"
        };
        let paragraph = Paragraph::new(text)
            .block(block)
            .style(Style::default().fg(Color::DarkGray));
        f.render_widget(paragraph, area);
        return;
    }

    let pad = |s: String| {
        if s.chars().count() > list_width {
            let truncated: String = s.chars().take(list_width.saturating_sub(3)).collect();
            format!("{}...", truncated)
        } else {
            s
        }
    };

    let mut items: Vec<ListItem> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let mut style = if i == cursor {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default()
            };
            if !m.is_read {
                style = style.add_modifier(Modifier::BOLD);
            }
            let time = m
                .timestamp()
                .with_timezone(&Local)
                .format("%b %d %Y @ %-I:%M%p");
            let indicator = if i == cursor { "█" } else { " " };
            let text = format!(
                "{} {}\n{} {}\n{} {}",
                indicator,
                pad(format!("From: {}", m.sender_label())),
                indicator,
                pad(format!("Time: {}", time)),
                indicator,
                pad(format!("Subj: {}", m.subject_or_default())),
            );
            ListItem::new(text).style(style)
        })
        .collect();

    let paging = !state.search.is_active() && (state.mailbox.has_more || state.mailbox.loading_more);
    if paging {
        let hint = if state.mailbox.loading_more {
            "  Loading more…"
        } else {
            "  [m] Load more"
        };
        items.push(ListItem::new(hint).style(Style::default().fg(Color::DarkGray)));
    }

    state.messages_list_state.select(Some(cursor));
    f.render_stateful_widget(List::new(items).block(block), area, &mut state.messages_list_state);
}

fn render_details(f: &mut Frame, state: &UIState<'_>, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Message")
        .border_style(border_style(state.focused_panel == FocusedPanel::Details));

    let content = match state.opened() {
        None => "No message selected".to_string(),
        Some(m) => {
            let recipients = |list: &[crate::models::Recipient]| {
                list.iter()
                    .map(|r| r.email_address.label().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let mut header = format!(
                "From: {}\nTo: {}\n",
                m.sender_label(),
                recipients(&m.to_recipients)
            );
            if !m.cc_recipients.is_empty() {
                header.push_str(&format!("Cc: {}\n", recipients(&m.cc_recipients)));
            }
            format!(
                "{}Date: {}\nSubject: {}\n\n{}",
                header,
                m.timestamp().with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                m.subject_or_default(),
                clean_body(&m.text_body())
            )
        }
    };

    let paragraph = Paragraph::new(content)
        .block(block)
        .wrap(Wrap { trim: true })
        .scroll((state.detail_scroll, 0));
    f.render_widget(paragraph, area);
}

fn render_compose(f: &mut Frame, cs: &mut ComposeState<'_>) {
    let area = centered_rect(80, 80, f.area());
    f.render_widget(Clear, area);

    let mut fields = vec![ComposeField::To];
    if cs.show_cc_bcc {
        fields.push(ComposeField::Cc);
        fields.push(ComposeField::Bcc);
    }
    fields.push(ComposeField::Subject);
    fields.push(ComposeField::Body);

    let constraints: Vec<Constraint> = fields
        .iter()
        .map(|field| match field {
            ComposeField::Body => Constraint::Min(10),
            _ => Constraint::Length(3),
        })
        .collect();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area);

    let body_title = if cs.show_cc_bcc {
        " Body [Esc to Cancel, Ctrl-S to Send, Tab to Switch, Ctrl-B to Hide CC/BCC] "
    } else {
        " Body [Esc to Cancel, Ctrl-S to Send, Tab to Switch, Ctrl-B to Show CC/BCC] "
    };

    let focused = cs.focused_field;
    for (field, chunk) in fields.iter().zip(chunks.iter()) {
        let (area_ref, title) = match field {
            ComposeField::To => (&mut cs.to, " To "),
            ComposeField::Cc => (&mut cs.cc, " Cc "),
            ComposeField::Bcc => (&mut cs.bcc, " Bcc "),
            ComposeField::Subject => (&mut cs.subject, " Subject "),
            ComposeField::Body => (&mut cs.body, body_title),
        };
        let style = if *field == focused {
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Gray)
        };
        area_ref.set_block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(style),
        );
        f.render_widget(&*area_ref, *chunk);

        if *field == focused {
            let (row, col) = area_ref.cursor();
            f.set_cursor_position((chunk.x + 1 + col as u16, chunk.y + 1 + row as u16));
        }
    }
}

fn render_authentication(f: &mut Frame, state: &UIState<'_>) {
    let area = centered_rect(60, 40, f.area());
    f.render_widget(Clear, area);

    let block = Block::default()
        .title(" Authentication Required ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Length(4),
            Constraint::Min(0),
        ])
        .split(inner);

    let msg = Paragraph::new("To access your Outlook mailbox, please visit the following URL in your browser and sign in:")
        .wrap(Wrap { trim: true });
    f.render_widget(msg, chunks[0]);

    match &state.auth_url {
        Some(url) => {
            let url_p = Paragraph::new(url.as_str())
                .style(
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::UNDERLINED),
                )
                .block(Block::default().borders(Borders::ALL).title(" URL "))
                .wrap(Wrap { trim: false });
            f.render_widget(url_p, chunks[1]);
        }
        None => f.render_widget(
            Paragraph::new("Checking stored credentials…").style(Style::default().fg(Color::Gray)),
            chunks[1],
        ),
    }

    let footer = Paragraph::new("Your default browser should have opened automatically. If not, copy the URL above.\n\nThe application will proceed automatically once complete. Press q to quit.")
        .style(Style::default().fg(Color::Gray))
        .wrap(Wrap { trim: true });
    f.render_widget(footer, chunks[2]);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

/// Normalizes line endings and collapses runs of blank lines to one.
fn clean_body(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n").replace('\r', "\n");
    let mut result = String::with_capacity(normalized.len());
    let mut consecutive_empty_lines = 0;
    let mut first_content = true;

    for line in normalized.split('\n') {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            consecutive_empty_lines += 1;
            continue;
        }
        if !first_content {
            let newlines = std::cmp::min(consecutive_empty_lines + 1, 2);
            for _ in 0..newlines {
                result.push('\n');
            }
        }
        result.push_str(trimmed);
        consecutive_empty_lines = 0;
        first_content = false;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::msg;

    #[test]
    fn test_clean_body_collapses_blank_runs() {
        assert_eq!(clean_body("Line 1\n\n\nLine 2\n\n\n\nLine 3"), "Line 1\n\nLine 2\n\nLine 3");
        assert_eq!(clean_body("Line 1\r\n        \r\n\r\nLine 2"), "Line 1\n\nLine 2");
        assert_eq!(clean_body("Line 1   \nLine 2\t"), "Line 1\nLine 2");
    }

    #[test]
    fn test_folder_label_shows_unread_count() {
        let folders = vec![
            MailFolderInfo {
                id: "AAMk-inbox".into(),
                display_name: "Inbox".into(),
                unread_item_count: 3,
                total_item_count: 10,
            },
            MailFolderInfo {
                id: "sentitems".into(),
                display_name: "Sent Items".into(),
                unread_item_count: 0,
                total_item_count: 4,
            },
        ];
        assert_eq!(folder_label(Folder::Inbox, &folders), "Inbox (3)");
        assert_eq!(folder_label(Folder::Sent, &folders), "Sent Items");
        assert_eq!(folder_label(Folder::Drafts, &folders), "Drafts");
    }

    #[test]
    fn test_visible_messages_follow_search() {
        let mut state = UIState::default();
        state.mailbox.messages = vec![msg("a", 2), msg("b", 1)];
        assert_eq!(state.visible_messages().len(), 2);

        state.search.query = "x".into();
        state.search.results = vec![msg("x", 5)];
        assert_eq!(state.highlighted().unwrap().id, "x");

        state.cursor = 4;
        state.clamp_cursor();
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn test_status_text_reports_refresh_and_badge() {
        let mut mailbox = MailboxSnapshot {
            refreshing: true,
            unseen_new: 2,
            ..Default::default()
        };
        assert_eq!(status_text(&mailbox), "Refreshing… | 2 new");
        mailbox.refreshing = false;
        mailbox.unseen_new = 0;
        assert_eq!(status_text(&mailbox), "");
    }

    #[test]
    fn test_compose_field_cycle_respects_cc_bcc() {
        let mut cs = ComposeState::new("");
        cs.next_field();
        assert_eq!(cs.focused_field, ComposeField::Subject);

        cs.toggle_cc_bcc();
        cs.prev_field();
        assert_eq!(cs.focused_field, ComposeField::Bcc);

        cs.toggle_cc_bcc();
        assert_eq!(cs.focused_field, ComposeField::To);
    }

    #[test]
    fn test_compose_collects_fields() {
        let mut cs = ComposeState::new("hello\n\n--\nsig");
        cs.to.insert_str("a@example.com, b@example.com");
        cs.subject.insert_str("Hi");
        let composition = cs.to_composition();
        assert_eq!(composition.to, "a@example.com, b@example.com");
        assert_eq!(composition.subject, "Hi");
        assert_eq!(composition.body, "hello\n\n--\nsig");
    }
}
