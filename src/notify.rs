use crate::models::Message;

/// Desktop notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Shows notifications through the desktop notification service. Whether
/// notifications are allowed is decided once at startup.
pub struct DesktopNotifier {
    granted: bool,
}

impl DesktopNotifier {
    /// Asks the notification service once whether it is reachable.
    pub fn probe(enabled: bool) -> Self {
        Self::with_check(enabled, service_available)
    }

    fn with_check(enabled: bool, check: impl FnOnce() -> Result<(), String>) -> Self {
        if !enabled {
            tracing::info!("desktop notifications disabled in settings");
            return Self { granted: false };
        }
        match check() {
            Ok(()) => Self { granted: true },
            Err(e) => {
                tracing::warn!("desktop notifications unavailable: {}", e);
                Self { granted: false }
            }
        }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn service_available() -> Result<(), String> {
    notify_rust::get_capabilities()
        .map(|caps| tracing::debug!("notification server capabilities: {:?}", caps))
        .map_err(|e| e.to_string())
}

#[cfg(not(all(unix, not(target_os = "macos"))))]
fn service_available() -> Result<(), String> {
    Ok(())
}

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, body: &str) {
        if !self.granted {
            return;
        }
        let (title, body) = (title.to_string(), body.to_string());
        // The notification daemon call blocks; keep it off the event loop.
        tokio::task::spawn_blocking(move || {
            if let Err(e) = notify_rust::Notification::new()
                .appname("otui")
                .summary(&title)
                .body(&body)
                .show()
            {
                tracing::warn!("desktop notification failed: {}", e);
            }
        });
    }
}

/// Title and body announcing newly arrived messages.
pub fn new_mail_summary(arrived: &[Message]) -> (String, String) {
    let title = if arrived.len() > 1 {
        "New emails received"
    } else {
        "New email received"
    };
    let body = match arrived {
        [one] => format!("From: {}", one.sender_label()),
        many => format!("{} new emails", many.len()),
    };
    (title.to_string(), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, Recipient};

    fn from(name: Option<&str>, address: &str) -> Message {
        Message {
            id: address.to_string(),
            from: Some(Recipient {
                email_address: EmailAddress {
                    name: name.map(str::to_string),
                    address: Some(address.to_string()),
                },
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_arrival_names_sender() {
        let (title, body) = new_mail_summary(&[from(Some("Ann"), "ann@example.com")]);
        assert_eq!(title, "New email received");
        assert_eq!(body, "From: Ann");

        let (_, body) = new_mail_summary(&[from(None, "bob@example.com")]);
        assert_eq!(body, "From: bob@example.com");
    }

    #[test]
    fn test_notifier_needs_setting_and_service() {
        let disabled = DesktopNotifier::with_check(false, || panic!("service checked"));
        assert!(!disabled.granted);

        let unreachable = DesktopNotifier::with_check(true, || Err("no D-Bus session".into()));
        assert!(!unreachable.granted);

        assert!(DesktopNotifier::with_check(true, || Ok(())).granted);
    }

    #[test]
    fn test_multiple_arrivals_are_counted() {
        let arrived = vec![from(None, "a@x"), from(None, "b@x"), from(None, "c@x")];
        let (title, body) = new_mail_summary(&arrived);
        assert_eq!(title, "New emails received");
        assert_eq!(body, "3 new emails");
    }
}
