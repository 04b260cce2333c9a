//! Notification aggregator
//!
//! Holds the paginated notification feed. Pages come from the REST
//! collaborator, single notifications from the push channel, and the two
//! are merged by id.
//!
//! Every page request carries the generation it was issued under. Loading
//! page 1 and clearing the feed both start a new generation, so responses
//! to older requests are recognised and discarded instead of resurrecting
//! stale items.
//!
//! The unread counter is taken from the server on every applied page and
//! adjusted locally in between.
//!
//! A failed optimistic mutation only undoes its own changes. Pushes that
//! arrived during the request stay, and counters set by a page applied in
//! the meantime are left as the server reported them.

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{ChatError, ChatResult};
use crate::optimistic::{with_rollback, Snapshot};
use crate::rest::NotificationApi;
use crate::types::{Notification, NotificationPage};

/// A page load in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct NotificationAggregator {
    items: Vec<Notification>,
    /// Last applied page, 0 before the first load
    page: u32,
    limit: u32,
    total: u64,
    unread: u64,
    generation: u64,
    /// Pages applied so far
    synced: u64,
    /// Value of `synced` when page 1 last replaced the feed
    refreshed_at: u64,
}

/// Rollback state; the generation is not part of it
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot {
    items: Vec<Notification>,
    page: u32,
    total: u64,
    unread: u64,
    synced: u64,
}

impl NotificationAggregator {
    pub fn new(limit: u32) -> Self {
        Self {
            items: Vec::new(),
            page: 0,
            limit: limit.max(1),
            total: 0,
            unread: 0,
            generation: 0,
            synced: 0,
            refreshed_at: 0,
        }
    }

    /// Start loading `page` (1-based)
    ///
    /// Page 1 is a refresh and supersedes every request issued before it.
    pub fn begin_load(&mut self, page: u32) -> PageRequest {
        let page = page.max(1);
        if page == 1 {
            self.generation += 1;
        }
        PageRequest {
            page,
            limit: self.limit,
            generation: self.generation,
        }
    }

    /// Request for the page after the last applied one
    pub fn begin_next(&mut self) -> PageRequest {
        self.begin_load(self.page + 1)
    }

    /// Merge a page response; returns how many notifications were new
    pub fn apply_page(&mut self, request: PageRequest, response: NotificationPage) -> ChatResult<usize> {
        if request.generation != self.generation {
            debug!(
                page = request.page,
                issued = request.generation,
                current = self.generation,
                "discarding superseded notification page"
            );
            return Err(ChatError::RequestSuperseded {
                issued: request.generation,
                current: self.generation,
            });
        }

        if request.page == 1 {
            self.items.clear();
        }
        let mut added = 0;
        for notification in response.data {
            if self.contains(&notification.id) {
                trace!(id = %notification.id, "notification already in feed");
                continue;
            }
            self.items.push(notification);
            added += 1;
        }

        self.page = if request.page == 1 {
            1
        } else {
            self.page.max(request.page)
        };
        self.total = response.total;
        self.unread = response.unread_total;
        self.synced += 1;
        if request.page == 1 {
            self.refreshed_at = self.synced;
        }
        Ok(added)
    }

    /// Prepend a pushed notification; false if it was already present
    pub fn receive_push(&mut self, notification: Notification) -> bool {
        if self.contains(&notification.id) {
            return false;
        }
        if !notification.is_read {
            self.unread += 1;
        }
        self.total += 1;
        self.items.insert(0, notification);
        true
    }

    pub fn mark_all_read_local(&mut self) {
        for notification in &mut self.items {
            notification.is_read = true;
        }
        self.unread = 0;
    }

    /// Mark one notification read; false if unknown or already read
    pub fn mark_read_local(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(notification) if !notification.is_read => {
                notification.is_read = true;
                self.unread = self.unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Empty the feed and invalidate every in-flight page request
    pub fn clear_local(&mut self) {
        self.items.clear();
        self.page = 0;
        self.total = 0;
        self.unread = 0;
        self.generation += 1;
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|n| n.id == id)
    }

    pub fn current_page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn unread_count(&self) -> u64 {
        self.unread
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the server has more notifications than are loaded
    pub fn has_more(&self) -> bool {
        (self.items.len() as u64) < self.total
    }
}

impl Snapshot for NotificationAggregator {
    type Snapshot = FeedSnapshot;

    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            items: self.items.clone(),
            page: self.page,
            total: self.total,
            unread: self.unread,
            synced: self.synced,
        }
    }

    fn restore(&mut self, snapshot: FeedSnapshot) {
        self.items = snapshot.items;
        self.page = snapshot.page;
        self.total = snapshot.total;
        self.unread = snapshot.unread;
        self.synced = snapshot.synced;
    }

    fn revert(&mut self, before: FeedSnapshot, after: FeedSnapshot) {
        if self.refreshed_at > after.synced {
            debug!("feed refreshed while the request was in flight, keeping server state");
            return;
        }

        let mut removed = Vec::new();
        for old in before.items {
            match after.items.iter().find(|n| n.id == old.id) {
                Some(mutated) => {
                    if !old.is_read && mutated.is_read {
                        if let Some(current) = self.items.iter_mut().find(|n| n.id == old.id) {
                            current.is_read = false;
                        }
                    }
                }
                None if !self.contains(&old.id) => removed.push(old),
                None => {}
            }
        }

        // A page applied since the mutation already carries server counters
        if self.synced == after.synced {
            self.unread += before.unread.saturating_sub(after.unread);
            self.total += before.total.saturating_sub(after.total);
        }
        if !removed.is_empty() {
            self.page = self.page.max(before.page);
            self.items.extend(removed);
        }
    }
}

/// Fetch `page` and merge it into `feed`
pub async fn load_page(
    feed: &Mutex<NotificationAggregator>,
    api: &dyn NotificationApi,
    page: u32,
) -> ChatResult<usize> {
    let request = feed.lock().begin_load(page);
    let response = api.fetch_notifications(request.page, request.limit).await?;
    feed.lock().apply_page(request, response)
}

/// Fetch the page after the last applied one
pub async fn load_next(feed: &Mutex<NotificationAggregator>, api: &dyn NotificationApi) -> ChatResult<usize> {
    let request = feed.lock().begin_next();
    let response = api.fetch_notifications(request.page, request.limit).await?;
    feed.lock().apply_page(request, response)
}

pub async fn mark_all_read(feed: &Mutex<NotificationAggregator>, api: &dyn NotificationApi) -> ChatResult<()> {
    with_rollback(
        feed,
        "mark all notifications read",
        NotificationAggregator::mark_all_read_local,
        api.mark_all_read(),
    )
    .await
}

pub async fn mark_read(
    feed: &Mutex<NotificationAggregator>,
    api: &dyn NotificationApi,
    id: &str,
) -> ChatResult<()> {
    with_rollback(
        feed,
        "mark notification read",
        |f| {
            f.mark_read_local(id);
        },
        api.mark_read(id),
    )
    .await
}

pub async fn clear(feed: &Mutex<NotificationAggregator>, api: &dyn NotificationApi) -> ChatResult<()> {
    with_rollback(
        feed,
        "clear notifications",
        NotificationAggregator::clear_local,
        api.clear(),
    )
    .await
}
