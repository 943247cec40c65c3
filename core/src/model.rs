// Event payload models
//
// Field names follow the camelCase the transport emits. Everything that a
// server may omit is optional or defaulted so older payloads still decode.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thread {
    pub context_id: String,
    pub thread_id: String,
    pub create_date: i64,
    pub creator: String,
    pub last_modification_date: i64,
    pub last_modifier: String,
    pub users: Vec<String>,
    pub managers: Vec<String>,
    pub version: i64,
    pub last_msg_date: i64,
    pub messages_count: i64,
    pub status_code: Option<i64>,
    pub schema_version: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessageInfo {
    pub thread_id: String,
    pub message_id: String,
    pub create_date: i64,
    pub author: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub info: ServerMessageInfo,
    pub author_pub_key: String,
    pub status_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Store {
    pub store_id: String,
    pub context_id: String,
    pub create_date: i64,
    pub creator: String,
    pub last_modification_date: i64,
    pub last_file_date: i64,
    pub last_modifier: String,
    pub users: Vec<String>,
    pub managers: Vec<String>,
    pub version: i64,
    pub files_count: i64,
    pub status_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerFileInfo {
    pub store_id: String,
    pub file_id: String,
    pub create_date: i64,
    pub author: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct File {
    pub info: ServerFileInfo,
    pub size: i64,
    pub author_pub_key: String,
    pub status_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Inbox {
    pub inbox_id: String,
    pub context_id: String,
    pub create_date: i64,
    pub creator: String,
    pub last_modification_date: i64,
    pub last_modifier: String,
    pub users: Vec<String>,
    pub managers: Vec<String>,
    pub version: i64,
    pub status_code: Option<i64>,
    pub schema_version: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboxEntry {
    pub entry_id: String,
    pub inbox_id: String,
    pub files: Vec<File>,
    pub author_pub_key: String,
    pub create_date: i64,
    pub status_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Kvdb {
    pub context_id: String,
    pub kvdb_id: String,
    pub create_date: i64,
    pub creator: String,
    pub last_modification_date: i64,
    pub last_modifier: String,
    pub users: Vec<String>,
    pub managers: Vec<String>,
    pub version: i64,
    pub entries: i64,
    pub last_entry_date: i64,
    pub status_code: Option<i64>,
    pub schema_version: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerKvdbEntryInfo {
    pub kvdb_id: String,
    pub key: String,
    pub create_date: i64,
    pub author: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KvdbEntry {
    pub info: ServerKvdbEntryInfo,
    pub author_pub_key: String,
    pub version: i64,
    pub status_code: Option<i64>,
}

// Event data records. These carry identifiers only, so every field is required.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStatsEventData {
    pub thread_id: String,
    pub last_msg_date: i64,
    pub messages_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDeletedEventData {
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDeletedMessageEventData {
    pub thread_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatsChangedEventData {
    pub context_id: String,
    pub store_id: String,
    pub last_file_date: i64,
    pub files_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDeletedEventData {
    pub store_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFileDeletedEventData {
    pub file_id: String,
    pub context_id: String,
    pub store_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxDeletedEventData {
    pub inbox_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntryDeletedEventData {
    pub inbox_id: String,
    pub entry_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvdbDeletedEventData {
    pub kvdb_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvdbDeletedEntryEventData {
    pub kvdb_id: String,
    pub kvdb_entry_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvdbStatsEventData {
    pub kvdb_id: String,
    pub last_entry_date: i64,
    pub entries: i64,
}
