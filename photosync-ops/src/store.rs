use tokio::sync::watch;

/// Observable value with a single writer. Readers always see either the previous
/// or the fully updated value.
pub struct Store<T> {
    tx: watch::Sender<T>,
}

impl<T> Store<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn snapshot(&self) -> T
    where
        T: Clone,
    {
        self.tx.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Receivers are notified once per committed update.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub(crate) fn modify(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Applies `f` and notifies subscribers only when it returns `true`.
    pub(crate) fn modify_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub(crate) fn replace(&self, value: T) -> T {
        self.tx.send_replace(value)
    }
}

impl<T: Default> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
