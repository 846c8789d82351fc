use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of folders the client shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Folder {
    #[default]
    Inbox,
    Sent,
    Drafts,
    Deleted,
}

impl Folder {
    pub const ALL: [Folder; 4] = [Folder::Inbox, Folder::Sent, Folder::Drafts, Folder::Deleted];

    /// Folders spanned by an all-folders fallback search.
    pub const SEARCHABLE: [Folder; 3] = [Folder::Inbox, Folder::Sent, Folder::Drafts];

    /// Well-known Graph folder name.
    pub fn graph_id(self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sentitems",
            Folder::Drafts => "drafts",
            Folder::Deleted => "deleteditems",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Folder::Inbox => "Inbox",
            Folder::Sent => "Sent Items",
            Folder::Drafts => "Drafts",
            Folder::Deleted => "Deleted Items",
        }
    }

    pub fn from_graph_id(id: &str) -> Option<Self> {
        Folder::ALL
            .into_iter()
            .find(|f| f.graph_id().eq_ignore_ascii_case(id))
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.graph_id())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl EmailAddress {
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.address.as_deref())
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default)]
    pub email_address: EmailAddress,
}

impl Recipient {
    pub fn address(address: &str) -> Self {
        Self {
            email_address: EmailAddress {
                name: None,
                address: Some(address.trim().to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    Html,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    #[serde(default)]
    pub content_type: ContentKind,
    #[serde(default)]
    pub content: String,
}

impl Body {
    /// Body as plain text; markup is rendered down with html2text.
    pub fn plain_text(&self) -> String {
        match self.content_type {
            ContentKind::Text => self.content.clone(),
            ContentKind::Html => html2text::from_read(self.content.as_bytes(), 120)
                .unwrap_or_else(|_| strip_tags(&self.content)),
        }
    }
}

/// Removes anything between `<` and `>`.
pub fn strip_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// A message as returned by the Graph `messages` endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body_preview: Option<String>,
    #[serde(default)]
    pub body: Option<Body>,
    #[serde(default)]
    pub from: Option<Recipient>,
    #[serde(default)]
    pub to_recipients: Vec<Recipient>,
    #[serde(default)]
    pub cc_recipients: Vec<Recipient>,
    #[serde(default)]
    pub received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// Sort key: received time, falling back to sent time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.received_date_time
            .or(self.sent_date_time)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn subject_or_default(&self) -> &str {
        self.subject
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("(No Subject)")
    }

    pub fn sender(&self) -> Option<&EmailAddress> {
        self.from.as_ref().map(|r| &r.email_address)
    }

    pub fn sender_label(&self) -> &str {
        self.sender().map(EmailAddress::label).unwrap_or("Unknown")
    }

    /// Text used for reading and client-side matching.
    pub fn text_body(&self) -> String {
        match &self.body {
            Some(body) if !body.content.is_empty() => body.plain_text(),
            _ => self.body_preview.clone().unwrap_or_default(),
        }
    }
}

/// Graph collection responses wrap their items in `value`.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

impl UserProfile {
    pub fn label(&self) -> String {
        let address = self.mail.as_deref().or(self.user_principal_name.as_deref());
        match (self.display_name.as_deref(), address) {
            (Some(name), Some(addr)) => format!("{} <{}>", name, addr),
            (Some(name), None) => name.to_string(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => "Unknown user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailFolderInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub unread_item_count: u32,
    #[serde(default)]
    pub total_item_count: u32,
}

/// A message being written by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composition {
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub body: String,
}

impl Composition {
    /// Request payload for `POST /me/sendMail`.
    pub fn to_send_payload(&self) -> serde_json::Value {
        let mut message = serde_json::json!({
            "subject": self.subject,
            "body": {
                "contentType": "HTML",
                "content": self.body,
            },
            "toRecipients": split_recipients(&self.to),
        });
        let cc = split_recipients(&self.cc);
        if !cc.is_empty() {
            message["ccRecipients"] = serde_json::json!(cc);
        }
        let bcc = split_recipients(&self.bcc);
        if !bcc.is_empty() {
            message["bccRecipients"] = serde_json::json!(bcc);
        }
        serde_json::json!({ "message": message })
    }
}

fn split_recipients(list: &str) -> Vec<Recipient> {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(Recipient::address)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserializes_graph_message() {
        let json = r#"{
            "id": "AAMk1",
            "subject": "Hello",
            "bodyPreview": "Hi there",
            "body": { "contentType": "html", "content": "<p>Hi <b>there</b></p>" },
            "from": { "emailAddress": { "name": "Ann", "address": "ann@example.com" } },
            "toRecipients": [ { "emailAddress": { "address": "me@example.com" } } ],
            "receivedDateTime": "2024-03-01T10:00:00Z",
            "isRead": false
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, "AAMk1");
        assert_eq!(msg.sender_label(), "Ann");
        assert_eq!(msg.to_recipients.len(), 1);
        assert!(msg.cc_recipients.is_empty());
        assert_eq!(msg.body.as_ref().unwrap().content_type, ContentKind::Html);
        assert!(!msg.is_read);
        assert_eq!(msg.timestamp().to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_timestamp_falls_back_to_sent() {
        let msg = Message {
            sent_date_time: "2024-01-02T00:00:00Z".parse().ok(),
            ..Default::default()
        };
        assert_eq!(msg.timestamp(), msg.sent_date_time.unwrap());
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(strip_tags("<p>Hi <b>there</b></p>"), "Hi there");
        assert_eq!(strip_tags("a > b"), "a > b");
    }

    #[test]
    fn test_send_payload_splits_recipients() {
        let c = Composition {
            to: "a@example.com, b@example.com".into(),
            cc: "".into(),
            bcc: "c@example.com".into(),
            subject: "Hi".into(),
            body: "<p>Body</p>".into(),
        };
        let payload = c.to_send_payload();
        let msg = &payload["message"];
        assert_eq!(msg["toRecipients"].as_array().unwrap().len(), 2);
        assert_eq!(
            msg["toRecipients"][1]["emailAddress"]["address"],
            "b@example.com"
        );
        assert!(msg.get("ccRecipients").is_none());
        assert_eq!(msg["bccRecipients"].as_array().unwrap().len(), 1);
        assert_eq!(msg["body"]["contentType"], "HTML");
    }

    #[test]
    fn test_folder_ids_round_trip() {
        for folder in Folder::ALL {
            assert_eq!(Folder::from_graph_id(folder.graph_id()), Some(folder));
        }
        assert_eq!(Folder::from_graph_id("archive"), None);
    }
}
