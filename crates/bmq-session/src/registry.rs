//! Open queues and their effective options.

use std::collections::HashMap;

use bmq_core::{QueueFlags, QueueOptions, SessionError};

/// State kept for one open queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub flags: QueueFlags,
    options: QueueOptions,
    pub suspended: bool,
    /// Set while a close round trip is in flight.
    pub closing: bool,
}

impl QueueEntry {
    /// Effective options; consumer fields of write-only queues read back
    /// as defaults.
    #[must_use]
    pub fn options(&self) -> QueueOptions {
        self.options.with_defaults()
    }

    fn store(&mut self, options: QueueOptions) {
        self.options = if self.flags.read {
            options
        } else {
            options.without_consumer_fields()
        };
    }
}

/// Registry of open queues, keyed by URI.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: HashMap<String, QueueEntry>,
}

impl QueueRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for a freshly opened queue.
    pub fn insert(&mut self, uri: &str, flags: QueueFlags, options: QueueOptions) {
        let mut entry = QueueEntry {
            flags,
            options: QueueOptions::default(),
            suspended: false,
            closing: false,
        };
        entry.store(options);
        self.queues.insert(uri.to_string(), entry);
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&QueueEntry> {
        self.queues.get(uri)
    }

    /// Overwrite only the fields set in `update`.
    pub fn apply(&mut self, uri: &str, update: &QueueOptions) -> bool {
        self.queues.get_mut(uri).is_some_and(|entry| {
            let merged = entry.options.merge(update);
            entry.store(merged);
            true
        })
    }

    pub fn remove(&mut self, uri: &str) -> Option<QueueEntry> {
        self.queues.remove(uri)
    }

    /// Mark a queue as closing for the duration of one close round trip.
    ///
    /// # Errors
    /// Returns error if the queue is not open or another close is in flight.
    pub fn begin_close(&mut self, uri: &str) -> Result<(), SessionError> {
        let entry = self
            .queues
            .get_mut(uri)
            .ok_or_else(|| SessionError::QueueNotOpened(uri.to_string()))?;
        if entry.closing {
            return Err(SessionError::CloseInProgress(uri.to_string()));
        }
        entry.closing = true;
        Ok(())
    }

    /// Undo [`QueueRegistry::begin_close`] after a failed close.
    pub fn abort_close(&mut self, uri: &str) {
        if let Some(entry) = self.queues.get_mut(uri) {
            entry.closing = false;
        }
    }

    pub fn set_suspended(&mut self, uri: &str, suspended: bool) -> bool {
        self.queues.get_mut(uri).is_some_and(|entry| {
            entry.suspended = suspended;
            true
        })
    }

    #[must_use]
    pub fn options(&self, uri: &str) -> Option<QueueOptions> {
        self.queues.get(uri).map(QueueEntry::options)
    }

    /// Queues to suspend when the host turns unhealthy, sorted by URI.
    #[must_use]
    pub fn suspendable(&self) -> Vec<String> {
        self.sorted(|entry| entry.options.suspends() && !entry.suspended && !entry.closing)
    }

    /// Queues currently suspended, sorted by URI.
    #[must_use]
    pub fn suspended_queues(&self) -> Vec<String> {
        self.sorted(|entry| entry.suspended)
    }

    fn sorted(&self, keep: impl Fn(&QueueEntry) -> bool) -> Vec<String> {
        let mut uris: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, entry)| keep(entry))
            .map(|(uri, _)| uri.clone())
            .collect();
        uris.sort();
        uris
    }

    /// Check that a message may be posted to `uri`.
    ///
    /// # Errors
    /// Returns error if the queue is not open, not writable or suspended.
    pub fn check_postable(&self, uri: &str) -> Result<(), SessionError> {
        let entry = self
            .queues
            .get(uri)
            .ok_or_else(|| SessionError::QueueNotOpened(uri.to_string()))?;
        if !entry.flags.write {
            return Err(SessionError::QueueNotWritable(uri.to_string()));
        }
        if entry.suspended {
            return Err(SessionError::QueueSuspended(uri.to_string()));
        }
        Ok(())
    }

    /// Check that a message delivered from `uri` may be confirmed.
    ///
    /// # Errors
    /// Returns error if the queue is not open or is being closed.
    pub fn check_confirmable(&self, uri: &str) -> Result<(), SessionError> {
        match self.queues.get(uri) {
            None => Err(SessionError::QueueNotOpened(uri.to_string())),
            Some(entry) if entry.closing => Err(SessionError::QueueClosing(uri.to_string())),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bmq_core::options::{DEFAULT_CONSUMER_PRIORITY, DEFAULT_MAX_UNCONFIRMED_MESSAGES};

    use super::*;

    #[test]
    fn test_write_only_drops_consumer_fields() {
        let mut registry = QueueRegistry::new();
        registry.insert(
            "bmq://d/w",
            QueueFlags::WRITE,
            QueueOptions::new()
                .max_unconfirmed_messages(7)
                .consumer_priority(9)
                .suspends_on_bad_host_health(true),
        );

        let options = registry.options("bmq://d/w").unwrap();
        assert_eq!(
            options.max_unconfirmed_messages,
            Some(DEFAULT_MAX_UNCONFIRMED_MESSAGES)
        );
        assert_eq!(options.consumer_priority, Some(DEFAULT_CONSUMER_PRIORITY));
        assert_eq!(options.suspends_on_bad_host_health, Some(true));

        registry.apply("bmq://d/w", &QueueOptions::new().consumer_priority(2));
        assert_eq!(
            registry.options("bmq://d/w").unwrap().consumer_priority,
            Some(DEFAULT_CONSUMER_PRIORITY)
        );
    }

    #[test]
    fn test_apply_is_partial() {
        let mut registry = QueueRegistry::new();
        registry.insert(
            "bmq://d/r",
            QueueFlags::READ,
            QueueOptions::new().max_unconfirmed_messages(7).consumer_priority(1),
        );
        assert!(registry.apply("bmq://d/r", &QueueOptions::new().consumer_priority(5)));
        let options = registry.options("bmq://d/r").unwrap();
        assert_eq!(options.max_unconfirmed_messages, Some(7));
        assert_eq!(options.consumer_priority, Some(5));

        assert!(!registry.apply("bmq://d/missing", &QueueOptions::new()));
    }

    #[test]
    fn test_suspension_bookkeeping() {
        let mut registry = QueueRegistry::new();
        let suspends = QueueOptions::new().suspends_on_bad_host_health(true);
        registry.insert("bmq://d/b", QueueFlags::READ, suspends);
        registry.insert("bmq://d/a", QueueFlags::WRITE, suspends);
        registry.insert("bmq://d/c", QueueFlags::READ, QueueOptions::new());

        assert_eq!(registry.suspendable(), vec!["bmq://d/a", "bmq://d/b"]);
        registry.set_suspended("bmq://d/a", true);
        assert_eq!(registry.suspendable(), vec!["bmq://d/b"]);
        assert_eq!(registry.suspended_queues(), vec!["bmq://d/a"]);

        assert!(matches!(
            registry.check_postable("bmq://d/a"),
            Err(SessionError::QueueSuspended(_))
        ));
    }

    #[test]
    fn test_post_and_confirm_checks() {
        let mut registry = QueueRegistry::new();
        registry.insert("bmq://d/r", QueueFlags::READ, QueueOptions::new());

        assert!(matches!(
            registry.check_postable("bmq://d/r"),
            Err(SessionError::QueueNotWritable(_))
        ));
        assert!(matches!(
            registry.check_postable("bmq://d/x"),
            Err(SessionError::QueueNotOpened(_))
        ));
        assert!(registry.check_confirmable("bmq://d/r").is_ok());

        registry.begin_close("bmq://d/r").unwrap();
        assert!(matches!(
            registry.check_confirmable("bmq://d/r"),
            Err(SessionError::QueueClosing(_))
        ));
        registry.remove("bmq://d/r");
        assert!(registry.get("bmq://d/r").is_none());
    }

    #[test]
    fn test_one_close_at_a_time() {
        let mut registry = QueueRegistry::new();
        registry.insert("bmq://d/r", QueueFlags::READ, QueueOptions::new());

        registry.begin_close("bmq://d/r").unwrap();
        assert!(matches!(
            registry.begin_close("bmq://d/r"),
            Err(SessionError::CloseInProgress(_))
        ));
        assert!(registry.get("bmq://d/r").is_some_and(|entry| entry.closing));

        registry.abort_close("bmq://d/r");
        assert!(registry.check_confirmable("bmq://d/r").is_ok());
        registry.begin_close("bmq://d/r").unwrap();

        assert!(matches!(
            registry.begin_close("bmq://d/x"),
            Err(SessionError::QueueNotOpened(_))
        ));
    }
}
