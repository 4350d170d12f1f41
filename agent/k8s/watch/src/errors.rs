use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, warn};

const MUTE_INTERVAL: Duration = Duration::from_secs(60);

/// Rate-limits repeated watch errors.
///
/// Certain error categories recur every reconnect attempt (the API server is
/// not up yet, a version-skewed payload fails to decode); those are logged
/// at most once per [`MUTE_INTERVAL`] per distinct message. Everything else
/// is logged unconditionally.
pub struct ErrorSink {
    muted: Mutex<HashMap<String, Instant>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Category {
    /// The API server is unreachable, typically during agent startup.
    ConnectionRefused,
    /// A watch payload failed to decode, typically due to version skew.
    Decode,
    /// The custom policy resource is registered under a conflicting legacy
    /// definition.
    ConflictingCrd,
    Other,
}

fn classify(message: &str) -> Category {
    let lower = message.to_ascii_lowercase();
    if lower.contains("connection refused") {
        return Category::ConnectionRefused;
    }
    if lower.contains("unable to decode")
        || lower.contains("only encoded map or array can be decoded")
    {
        return Category::Decode;
    }
    if lower.contains("the server could not find the requested resource") {
        return Category::ConflictingCrd;
    }
    Category::Other
}

// === impl ErrorSink ===

impl Default for ErrorSink {
    fn default() -> Self {
        Self {
            muted: Mutex::new(HashMap::default()),
        }
    }
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, resource: &str, error: &dyn std::fmt::Display) {
        let message = error.to_string();
        match classify(&message) {
            Category::Other => error!(%resource, error = %message, "watch error"),
            Category::ConnectionRefused => {
                if self.unmuted(&message, Instant::now()) {
                    error!(%resource, error = %message, "watch error");
                }
            }
            Category::Decode => {
                if self.unmuted(&message, Instant::now()) {
                    error!(%resource, error = %message, "unable to decode watch event");
                }
            }
            Category::ConflictingCrd => {
                if self.unmuted(&message, Instant::now()) {
                    error!(%resource, error = %message, "conflicting policy resource definitions");
                    warn!("a legacy policy resource definition is still registered; migrate it to the current CRD");
                    warn!("policy enforcement cannot be guaranteed while the conflicting definitions coexist");
                }
            }
        }
    }

    /// Records the message and reports whether it may be logged; the message
    /// is muted again until `now + MUTE_INTERVAL`.
    fn unmuted(&self, message: &str, now: Instant) -> bool {
        let mut muted = self.muted.lock();
        match muted.get(message) {
            Some(deadline) if now < *deadline => false,
            _ => {
                muted.insert(message.to_string(), now + MUTE_INTERVAL);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_failure_modes() {
        assert_eq!(
            classify("error trying to connect: Connection refused (os error 111)"),
            Category::ConnectionRefused
        );
        assert_eq!(
            classify("Unable to decode an event from the watch stream"),
            Category::Decode
        );
        assert_eq!(
            classify("the server could not find the requested resource"),
            Category::ConflictingCrd
        );
        assert_eq!(classify("some other failure"), Category::Other);
    }

    #[test]
    fn repeated_messages_are_muted_for_the_interval() {
        let sink = ErrorSink::new();
        let start = Instant::now();
        assert!(sink.unmuted("connection refused", start));
        assert!(!sink.unmuted("connection refused", start + Duration::from_secs(1)));
        assert!(!sink.unmuted("connection refused", start + MUTE_INTERVAL - Duration::from_secs(1)));
        assert!(sink.unmuted("connection refused", start + MUTE_INTERVAL));

        // Distinct messages are muted independently.
        assert!(sink.unmuted("another error", start));
    }
}
