// Typed catalog of the events a connection can deliver
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::envelope::kinds;
use crate::model::*;

/// A `(channel, kind)` pair together with the payload type its events carry.
///
/// Registering through an `EventType<T>` makes the dispatcher decode each
/// payload into `T` before the callback sees it.
pub struct EventType<T> {
    channel: String,
    kind: &'static str,
    _payload: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> EventType<T> {
    pub fn new(channel: impl Into<String>, kind: &'static str) -> Self {
        Self {
            channel: channel.into(),
            kind,
            _payload: PhantomData,
        }
    }
}

impl<T> EventType<T> {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl<T> Clone for EventType<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            kind: self.kind,
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for EventType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("channel", &self.channel)
            .field("kind", &self.kind)
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}

fn scoped(module: &str, id: &str, subtype: &str) -> String {
    format!("{module}/{id}/{subtype}")
}

// Connection

pub fn connected() -> EventType<()> {
    EventType::new("", kinds::CONNECTED)
}

pub fn disconnected() -> EventType<()> {
    EventType::new("", kinds::DISCONNECTED)
}

// Threads

pub fn thread_created() -> EventType<Thread> {
    EventType::new("thread", "threadCreated")
}

pub fn thread_updated() -> EventType<Thread> {
    EventType::new("thread", "threadUpdated")
}

pub fn thread_stats_changed() -> EventType<ThreadStatsEventData> {
    EventType::new("thread", "threadStats")
}

pub fn thread_deleted() -> EventType<ThreadDeletedEventData> {
    EventType::new("thread", "threadDeleted")
}

pub fn thread_new_message(thread_id: &str) -> EventType<Message> {
    EventType::new(scoped("thread", thread_id, "messages"), "threadNewMessage")
}

pub fn thread_message_updated(thread_id: &str) -> EventType<Message> {
    EventType::new(scoped("thread", thread_id, "messages"), "threadUpdatedMessage")
}

pub fn thread_message_deleted(thread_id: &str) -> EventType<ThreadDeletedMessageEventData> {
    EventType::new(scoped("thread", thread_id, "messages"), "threadMessageDeleted")
}

// Stores

pub fn store_created() -> EventType<Store> {
    EventType::new("store", "storeCreated")
}

pub fn store_updated() -> EventType<Store> {
    EventType::new("store", "storeUpdated")
}

pub fn store_stats_changed() -> EventType<StoreStatsChangedEventData> {
    EventType::new("store", "storeStatsChanged")
}

pub fn store_deleted() -> EventType<StoreDeletedEventData> {
    EventType::new("store", "storeDeleted")
}

pub fn store_file_created(store_id: &str) -> EventType<File> {
    EventType::new(scoped("store", store_id, "files"), "storeFileCreated")
}

pub fn store_file_updated(store_id: &str) -> EventType<File> {
    EventType::new(scoped("store", store_id, "files"), "storeFileUpdated")
}

pub fn store_file_deleted(store_id: &str) -> EventType<StoreFileDeletedEventData> {
    EventType::new(scoped("store", store_id, "files"), "storeFileDeleted")
}

// Inboxes

pub fn inbox_created() -> EventType<Inbox> {
    EventType::new("inbox", "inboxCreated")
}

pub fn inbox_updated() -> EventType<Inbox> {
    EventType::new("inbox", "inboxUpdated")
}

pub fn inbox_deleted() -> EventType<InboxDeletedEventData> {
    EventType::new("inbox", "inboxDeleted")
}

pub fn inbox_entry_created(inbox_id: &str) -> EventType<InboxEntry> {
    EventType::new(scoped("inbox", inbox_id, "entries"), "inboxEntryCreated")
}

pub fn inbox_entry_deleted(inbox_id: &str) -> EventType<InboxEntryDeletedEventData> {
    EventType::new(scoped("inbox", inbox_id, "entries"), "inboxEntryDeleted")
}

// Key-value databases

pub fn kvdb_created() -> EventType<Kvdb> {
    EventType::new("kvdb", "kvdbCreated")
}

pub fn kvdb_updated() -> EventType<Kvdb> {
    EventType::new("kvdb", "kvdbUpdated")
}

pub fn kvdb_deleted() -> EventType<KvdbDeletedEventData> {
    EventType::new("kvdb", "kvdbDeleted")
}

pub fn kvdb_stats_changed() -> EventType<KvdbStatsEventData> {
    EventType::new("kvdb", "kvdbStatsChanged")
}

pub fn kvdb_new_entry(kvdb_id: &str) -> EventType<KvdbEntry> {
    EventType::new(scoped("kvdb", kvdb_id, "entries"), "kvdbNewEntry")
}

pub fn kvdb_entry_updated(kvdb_id: &str) -> EventType<KvdbEntry> {
    EventType::new(scoped("kvdb", kvdb_id, "entries"), "kvdbEntryUpdated")
}

pub fn kvdb_entry_deleted(kvdb_id: &str) -> EventType<KvdbDeletedEntryEventData> {
    EventType::new(scoped("kvdb", kvdb_id, "entries"), "kvdbEntryDeleted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelAddress;

    #[test]
    fn scoped_events_share_one_channel_per_instance() {
        let a = thread_new_message("t1");
        let b = thread_message_deleted("t1");
        assert_eq!(a.channel(), "thread/t1/messages");
        assert_eq!(a.channel(), b.channel());
        assert_ne!(a.kind(), b.kind());
    }

    #[test]
    fn every_module_channel_parses() {
        let channels = [
            thread_created().channel().to_string(),
            store_file_created("s").channel().to_string(),
            inbox_entry_created("i").channel().to_string(),
            kvdb_new_entry("k").channel().to_string(),
        ];
        for channel in channels {
            assert!(ChannelAddress::parse(&channel).is_ok(), "{channel}");
        }
    }

    #[test]
    fn control_events_have_no_channel() {
        assert_eq!(connected().channel(), "");
        assert_eq!(disconnected().kind(), kinds::DISCONNECTED);
    }
}
