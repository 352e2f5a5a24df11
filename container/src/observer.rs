use crate::container::{Container, Observer};
use std::cell::{Cell, RefCell};

/// Opaque handle returned by [`ObserverList::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

/// Subscription list for container attribute observers.
///
/// Notification order is unspecified. Observers may subscribe or unsubscribe
/// from inside a callback; an observer removed mid-notification is not called.
#[derive(Default)]
pub struct ObserverList {
    next: Cell<u64>,
    entries: RefCell<Vec<(ObserverToken, Observer)>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Observer) -> ObserverToken {
        let token = ObserverToken(self.next.get());
        self.next.set(self.next.get() + 1);
        self.entries.borrow_mut().push((token, observer));
        token
    }

    pub fn unsubscribe(&self, token: ObserverToken) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(t, _)| *t != token);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn notify(&self, container: &dyn Container) {
        let tokens: Vec<ObserverToken> = self.entries.borrow().iter().map(|(t, _)| *t).collect();

        for token in tokens {
            let observer = self
                .entries
                .borrow()
                .iter()
                .find(|(t, _)| *t == token)
                .map(|(_, o)| o.clone());

            if let Some(observer) = observer {
                observer(container);
            }
        }
    }
}
