use std::collections::HashSet;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::remote::{Keyed, PageSource, RemoteError};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("page fetch failed: {0}")]
    Fetch(#[from] RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    /// No page fetched yet for the current query.
    Start,
    Next(String),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Appended {
        added: usize,
        duplicates: usize,
        exhausted: bool,
    },
    /// Another fetch already holds the cursor; this call was coalesced into it.
    InFlight,
    Exhausted,
    /// The query changed while the fetch was outstanding; its page was dropped.
    Stale,
}

#[derive(Debug, Clone)]
pub struct PagerState<T, Q> {
    pub query: Q,
    pub items: Vec<T>,
    pub cursor: CursorState,
    pub loading: bool,
    pub pages_loaded: u32,
    pub last_error: Option<String>,
    generation: u64,
    keys: HashSet<String>,
}

impl<T, Q> PagerState<T, Q> {
    fn new(query: Q) -> Self {
        Self {
            query,
            items: Vec::new(),
            cursor: CursorState::Start,
            loading: false,
            pages_loaded: 0,
            last_error: None,
            generation: 0,
            keys: HashSet::new(),
        }
    }

    pub fn has_more(&self) -> bool {
        self.cursor != CursorState::Exhausted
    }

    fn clear(&mut self, query: Q) {
        self.generation += 1;
        self.query = query;
        self.items.clear();
        self.keys.clear();
        self.cursor = CursorState::Start;
        self.loading = false;
        self.pages_loaded = 0;
        self.last_error = None;
    }
}

pub struct CursorPager<S: PageSource> {
    source: S,
    page_size: u32,
    store: Store<PagerState<S::Item, S::Query>>,
}

impl<S: PageSource> CursorPager<S> {
    pub fn new(source: S, query: S::Query, page_size: u32) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            store: Store::new(PagerState::new(query)),
        }
    }

    pub fn snapshot(&self) -> PagerState<S::Item, S::Query> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PagerState<S::Item, S::Query>> {
        self.store.subscribe()
    }

    pub fn len(&self) -> usize {
        self.store.read(|state| state.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.store.read(PagerState::has_more)
    }

    pub fn is_loading(&self) -> bool {
        self.store.read(|state| state.loading)
    }

    /// Fetches the page after the held cursor and appends it. Calls made while a
    /// fetch is outstanding, or after the listing is exhausted, do nothing.
    pub async fn load_more(&self) -> Result<LoadOutcome, PagerError> {
        let mut claimed = None;
        let mut skipped = LoadOutcome::InFlight;
        self.store.modify_if(|state| {
            if state.loading {
                return false;
            }
            let cursor = match &state.cursor {
                CursorState::Start => None,
                CursorState::Next(cursor) => Some(cursor.clone()),
                CursorState::Exhausted => {
                    skipped = LoadOutcome::Exhausted;
                    return false;
                }
            };
            state.loading = true;
            claimed = Some((state.generation, state.query.clone(), cursor));
            true
        });
        let Some((generation, query, cursor)) = claimed else {
            return Ok(skipped);
        };

        let mut guard = InFlight {
            store: &self.store,
            generation,
            armed: true,
        };
        debug!(cursor = cursor.as_deref().unwrap_or("<start>"), "fetching page");
        let result = self
            .source
            .fetch_page(&query, cursor.as_deref(), self.page_size)
            .await;
        guard.armed = false;

        match result {
            Ok(page) => {
                let mut outcome = LoadOutcome::Stale;
                self.store.modify_if(|state| {
                    if state.generation != generation {
                        return false;
                    }
                    let mut added = 0;
                    let mut duplicates = 0;
                    for item in page.items {
                        if state.keys.insert(item.key().to_string()) {
                            state.items.push(item);
                            added += 1;
                        } else {
                            duplicates += 1;
                        }
                    }
                    state.cursor = match page.next_cursor.filter(|cursor| !cursor.is_empty()) {
                        Some(cursor) => CursorState::Next(cursor),
                        None => CursorState::Exhausted,
                    };
                    state.loading = false;
                    state.pages_loaded += 1;
                    state.last_error = None;
                    outcome = LoadOutcome::Appended {
                        added,
                        duplicates,
                        exhausted: state.cursor == CursorState::Exhausted,
                    };
                    true
                });
                if let LoadOutcome::Appended { duplicates, .. } = outcome
                    && duplicates > 0
                {
                    warn!(duplicates, "page repeated already listed items; ignored");
                }
                Ok(outcome)
            }
            Err(err) => {
                let applied = self.store.modify_if(|state| {
                    if state.generation != generation {
                        return false;
                    }
                    state.loading = false;
                    state.last_error = Some(err.message());
                    true
                });
                if !applied {
                    return Ok(LoadOutcome::Stale);
                }
                warn!(error = %err, "page fetch failed; cursor kept for retry");
                Err(PagerError::Fetch(err))
            }
        }
    }

    /// Drops everything accumulated for the previous query and fetches the first
    /// page of `query`. An outstanding fetch for the old query is discarded when
    /// it returns.
    pub async fn restart(&self, query: S::Query) -> Result<LoadOutcome, PagerError> {
        self.reset(query);
        self.load_more().await
    }

    pub fn reset(&self, query: S::Query) {
        self.store.modify(|state| state.clear(query));
    }
}

/// Releases the in-flight claim if the fetch future is dropped before it settles.
struct InFlight<'a, T, Q> {
    store: &'a Store<PagerState<T, Q>>,
    generation: u64,
    armed: bool,
}

impl<T, Q> Drop for InFlight<'_, T, Q> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let generation = self.generation;
        self.store.modify_if(|state| {
            if state.generation != generation || !state.loading {
                return false;
            }
            state.loading = false;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photosync_core::Page;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(String);

    impl Keyed for Item {
        fn key(&self) -> &str {
            &self.0
        }
    }

    /// Serves pages keyed by `(query, cursor)`; unknown keys fail.
    #[derive(Default)]
    struct FakeSource {
        pages: Mutex<HashMap<(String, Option<String>), Page<Item>>>,
        failures: Mutex<Vec<(String, Option<String>)>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeSource {
        fn with_page(
            self,
            query: &str,
            cursor: Option<&str>,
            ids: &[&str],
            next: Option<&str>,
        ) -> Self {
            self.pages.lock().unwrap().insert(
                (query.to_string(), cursor.map(str::to_string)),
                Page {
                    items: ids.iter().map(|id| Item(id.to_string())).collect(),
                    next_cursor: next.map(str::to_string),
                },
            );
            self
        }

        fn fail_once(&self, query: &str, cursor: Option<&str>) {
            self.failures
                .lock()
                .unwrap()
                .push((query.to_string(), cursor.map(str::to_string)));
        }
    }

    impl PageSource for FakeSource {
        type Item = Item;
        type Query = String;

        async fn fetch_page(
            &self,
            query: &String,
            cursor: Option<&str>,
            _page_size: u32,
        ) -> Result<Page<Item>, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let key = (query.clone(), cursor.map(str::to_string));
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(pos) = failures.iter().position(|f| *f == key) {
                    failures.remove(pos);
                    return Err(RemoteError::Backend("gateway timeout".into()));
                }
            }
            self.pages
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .ok_or_else(|| RemoteError::Backend(format!("no page for {key:?}")))
        }
    }

    fn ids<S: PageSource<Item = Item>>(pager: &CursorPager<S>) -> Vec<String> {
        pager.snapshot().items.into_iter().map(|item| item.0).collect()
    }

    #[tokio::test]
    async fn pages_are_appended_in_server_order_until_exhausted() {
        let source = FakeSource::default()
            .with_page("", None, &["a", "b"], Some("c1"))
            .with_page("", Some("c1"), &["c", "d"], None);
        let pager = CursorPager::new(source, String::new(), 2);

        assert_eq!(
            pager.load_more().await.unwrap(),
            LoadOutcome::Appended {
                added: 2,
                duplicates: 0,
                exhausted: false
            }
        );
        assert!(pager.has_more());
        assert_eq!(
            pager.load_more().await.unwrap(),
            LoadOutcome::Appended {
                added: 2,
                duplicates: 0,
                exhausted: true
            }
        );
        assert_eq!(ids(&pager), ["a", "b", "c", "d"]);
        assert!(!pager.has_more());

        assert_eq!(pager.load_more().await.unwrap(), LoadOutcome::Exhausted);
        assert_eq!(pager.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_load_more_is_coalesced() {
        let source = FakeSource {
            delay: Some(Duration::from_millis(200)),
            ..FakeSource::default()
        }
        .with_page("", None, &["a", "b"], Some("c1"));
        let pager = CursorPager::new(source, String::new(), 2);

        let (first, second) = tokio::join!(pager.load_more(), pager.load_more());

        assert!(matches!(first.unwrap(), LoadOutcome::Appended { added: 2, .. }));
        assert_eq!(second.unwrap(), LoadOutcome::InFlight);
        assert_eq!(pager.source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pager.snapshot().pages_loaded, 1);
        assert!(!pager.is_loading());
    }

    #[tokio::test]
    async fn repeated_identifiers_are_ignored() {
        let source = FakeSource::default()
            .with_page("", None, &["a", "b", "a"], Some("c1"))
            .with_page("", Some("c1"), &["b", "c"], None);
        let pager = CursorPager::new(source, String::new(), 3);

        pager.load_more().await.unwrap();
        let outcome = pager.load_more().await.unwrap();

        assert_eq!(
            outcome,
            LoadOutcome::Appended {
                added: 1,
                duplicates: 1,
                exhausted: true
            }
        );
        assert_eq!(ids(&pager), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cursor_and_items_for_retry() {
        let source = FakeSource::default()
            .with_page("", None, &["a"], Some("c1"))
            .with_page("", Some("c1"), &["b"], None);
        let pager = CursorPager::new(source, String::new(), 1);
        pager.load_more().await.unwrap();
        pager.source.fail_once("", Some("c1"));

        let err = pager.load_more().await.unwrap_err();
        assert!(matches!(err, PagerError::Fetch(_)));
        let state = pager.snapshot();
        assert_eq!(state.cursor, CursorState::Next("c1".into()));
        assert_eq!(ids(&pager), ["a"]);
        assert_eq!(state.last_error.as_deref(), Some("gateway timeout"));
        assert!(!state.loading);

        pager.load_more().await.unwrap();
        assert_eq!(ids(&pager), ["a", "b"]);
        assert!(pager.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn restart_clears_previous_query() {
        let source = FakeSource::default()
            .with_page("cats", None, &["c1", "c2"], Some("n"))
            .with_page("dogs", None, &["d1"], None);
        let pager = CursorPager::new(source, "cats".to_string(), 2);
        pager.load_more().await.unwrap();

        pager.restart("dogs".to_string()).await.unwrap();

        let state = pager.snapshot();
        assert_eq!(state.query, "dogs");
        assert_eq!(ids(&pager), ["d1"]);
        assert_eq!(state.cursor, CursorState::Exhausted);
        assert_eq!(state.pages_loaded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_for_replaced_query_is_dropped() {
        let source = FakeSource {
            delay: Some(Duration::from_millis(500)),
            ..FakeSource::default()
        }
        .with_page("cats", None, &["c1"], None)
        .with_page("dogs", None, &["d1"], None);
        let pager = CursorPager::new(source, "cats".to_string(), 5);

        let (old, new) = tokio::join!(pager.load_more(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            pager.restart("dogs".to_string()).await
        });

        assert_eq!(old.unwrap(), LoadOutcome::Stale);
        assert!(matches!(new.unwrap(), LoadOutcome::Appended { added: 1, .. }));
        assert_eq!(ids(&pager), ["d1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_fetch_releases_in_flight_flag() {
        let source = FakeSource {
            delay: Some(Duration::from_secs(5)),
            ..FakeSource::default()
        }
        .with_page("", None, &["a"], None);
        let pager = CursorPager::new(source, String::new(), 1);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), pager.load_more()).await;
        assert!(timed_out.is_err());
        assert!(!pager.is_loading());
        assert_eq!(pager.snapshot().cursor, CursorState::Start);
    }

    #[tokio::test]
    async fn subscribers_are_notified_per_page() {
        let source = FakeSource::default().with_page("", None, &["a"], None);
        let pager = CursorPager::new(source, String::new(), 1);
        let mut rx = pager.subscribe();

        pager.load_more().await.unwrap();

        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update();
        assert_eq!(state.items.len(), 1);
        assert!(!state.loading);
    }
}
