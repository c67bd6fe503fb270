//! Single-slot mailbox: overwrite on write, clear on read.
//!
//! Unlike a queue, at most one unread value exists at any time. A writer that
//! arrives before the previous value was consumed replaces it.

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store `value`, returning the unread value it replaced, if any.
    pub fn put(&self, value: T) -> Option<T> {
        self.slot.lock().replace(value)
    }

    /// Store `value` only if `accept` holds, checked under the slot lock.
    ///
    /// Returns whether the value was stored.
    pub fn put_if(&self, value: T, accept: impl FnOnce() -> bool) -> bool {
        let mut slot = self.slot.lock();
        if !accept() {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// Take the current value, leaving the slot empty.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Discard any unread value.
    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl<T: Clone> Mailbox<T> {
    /// Read the current value without consuming it.
    pub fn peek(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_write_overwrites_first() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.put("first".to_string()), None);
        assert_eq!(mailbox.put("second".to_string()), Some("first".to_string()));
        assert_eq!(mailbox.try_take().as_deref(), Some("second"));
    }

    #[test]
    fn take_clears_until_next_write() {
        let mailbox = Mailbox::new();
        mailbox.put(1);
        assert_eq!(mailbox.try_take(), Some(1));
        assert_eq!(mailbox.try_take(), None);
        mailbox.put(2);
        assert_eq!(mailbox.peek(), Some(2));
        assert_eq!(mailbox.peek(), Some(2));
        mailbox.clear();
        assert!(mailbox.is_empty());
    }

    #[test]
    fn rejected_conditional_write_leaves_slot_alone() {
        let mailbox = Mailbox::new();
        mailbox.put("current");
        assert!(!mailbox.put_if("stale", || false));
        assert_eq!(mailbox.peek(), Some("current"));
        assert!(mailbox.put_if("fresh", || true));
        assert_eq!(mailbox.try_take(), Some("fresh"));
    }
}
