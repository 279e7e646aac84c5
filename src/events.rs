use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;

/// A token naming one subscription in a [`Listeners`] list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// A broadcast list of channel subscribers keyed by token, so removal
/// is O(1) and emitting prunes dead receivers as it goes.
#[derive(Debug)]
pub(crate) struct Listeners<T> {
    next_token: u64,
    senders: HashMap<u64, Sender<T>>,
}

impl<T: Clone> Listeners<T> {
    pub(crate) fn new() -> Self {
        Listeners {
            next_token: 0,
            senders: HashMap::new(),
        }
    }

    pub(crate) fn subscribe(&mut self) -> (SubscriptionToken, Receiver<T>) {
        let (sender, receiver) = unbounded();
        let token = SubscriptionToken(self.next_token);
        self.next_token += 1;
        self.senders.insert(token.0, sender);
        (token, receiver)
    }

    pub(crate) fn unsubscribe(&mut self, token: SubscriptionToken) {
        self.senders.remove(&token.0);
    }

    pub(crate) fn emit(&mut self, event: T) {
        self.senders
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_all_live_subscribers() {
        let mut listeners = Listeners::new();
        let (_token_a, rx_a) = listeners.subscribe();
        let (token_b, rx_b) = listeners.subscribe();
        listeners.emit(1u32);
        assert_eq!(rx_a.try_recv().unwrap(), 1);
        assert_eq!(rx_b.try_recv().unwrap(), 1);

        listeners.unsubscribe(token_b);
        listeners.emit(2);
        assert_eq!(rx_a.try_recv().unwrap(), 2);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dropped_receivers_are_pruned_on_emit() {
        let mut listeners = Listeners::new();
        let (_token, rx) = listeners.subscribe();
        drop(rx);
        listeners.emit(1u32);
        assert!(listeners.is_empty());
    }
}
