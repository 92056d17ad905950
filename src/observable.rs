//! Observable status values
//!
//! Thin wrapper over `tokio::sync::watch` used for the externally published
//! status of a connection: the `connected` and `running` flags and the current
//! error report. All clones share the same channel, so a status publisher can
//! hold one clone while the scheduler updates another.
//!
//! ```rust,ignore
//! let running = Observable::new("running", false);
//! let mut rx = running.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("running = {}", *rx.borrow());
//!     }
//! });
//! running.set(true);
//! ```

use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// A named value with change notification.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    name: Arc<str>,
}

impl<T: Clone + Send + Sync + Debug + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("value", &*self.sender.borrow())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            name: self.name.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            name: Arc::from(name.into()),
        }
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the observable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the value, notifying all subscribers. Returns the previous value.
    pub fn set(&self, value: T) -> T {
        self.sender.send_replace(value)
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Set the value only if it differs; subscribers are woken only on change.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_the_channel() {
        let flag = Observable::new("connected", false);
        let publisher = flag.clone();
        let mut rx = publisher.subscribe();

        assert!(!flag.set(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(publisher.get());
        assert_eq!(publisher.name(), "connected");
    }

    #[test]
    fn set_if_changed_skips_identical_values() {
        let flag = Observable::new("running", false);
        let rx = flag.subscribe();

        assert!(!flag.set_if_changed(false));
        assert!(!rx.has_changed().unwrap());

        assert!(flag.set_if_changed(true));
        assert!(rx.has_changed().unwrap());
        assert_eq!(flag.subscriber_count(), 1);
    }
}
