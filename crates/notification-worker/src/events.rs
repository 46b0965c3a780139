//! 图书生命周期事件
//!
//! 每个队列只承载一种事件，事件类型由队列名决定而不是由负载中的 `event` 字段决定。
//! 解码是纯结构化的：缺失字段、`null` 字段取空串或 0，重复键取最后一个值。
//! 负载不是合法 JSON、顶层不是对象，或类型不匹配（如 `book_id` 为字符串）时才报错。

use std::fmt;

use notify_shared::kafka::queues;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

// ---------------------------------------------------------------------------
// EventKind: 事件类型
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BookCreated,
    BookBorrowed,
    BookReturned,
}

impl EventKind {
    /// 服务消费的全部事件类型，顺序即启动消费循环的顺序
    pub const ALL: [EventKind; 3] = [
        EventKind::BookCreated,
        EventKind::BookBorrowed,
        EventKind::BookReturned,
    ];

    /// 承载该事件的队列名
    pub fn queue(&self) -> &'static str {
        match self {
            Self::BookCreated => queues::BOOK_CREATED,
            Self::BookBorrowed => queues::BOOK_BORROWED,
            Self::BookReturned => queues::BOOK_RETURNED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookCreated => "book.created",
            Self::BookBorrowed => "book.borrowed",
            Self::BookReturned => "book.returned",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 事件负载
// ---------------------------------------------------------------------------

/// 上游偶尔会把空值序列化为 `null`，按缺失字段处理
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 新书入库
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookCreated {
    #[serde(deserialize_with = "null_as_default")]
    pub event: String,
    #[serde(deserialize_with = "null_as_default")]
    pub book_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
}

/// 图书借出
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookBorrowed {
    #[serde(deserialize_with = "null_as_default")]
    pub event: String,
    #[serde(deserialize_with = "null_as_default")]
    pub book_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub member_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub book_title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub member_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub member_phone: String,
    #[serde(deserialize_with = "null_as_default")]
    pub borrowed_date: String,
    #[serde(deserialize_with = "null_as_default")]
    pub due_date: String,
}

/// 图书归还，字段为借出事件加上归还日期
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookReturned {
    #[serde(deserialize_with = "null_as_default")]
    pub event: String,
    #[serde(deserialize_with = "null_as_default")]
    pub book_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub member_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub book_title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub member_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub member_phone: String,
    #[serde(deserialize_with = "null_as_default")]
    pub borrowed_date: String,
    #[serde(deserialize_with = "null_as_default")]
    pub due_date: String,
    #[serde(deserialize_with = "null_as_default")]
    pub returned_date: String,
}

// ---------------------------------------------------------------------------
// LibraryEvent: 解码后的事件
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryEvent {
    Created(BookCreated),
    Borrowed(BookBorrowed),
    Returned(BookReturned),
}

impl LibraryEvent {
    /// 按队列隐含的事件类型解码原始负载
    ///
    /// 顶层必须是 JSON 对象，数组不会按位置映射到字段；重复键取最后一个值。
    pub fn decode(kind: EventKind, payload: &[u8]) -> Result<Self, DecodeError> {
        let wrap = |source| DecodeError { kind, source };
        let fields: Map<String, Value> = serde_json::from_slice(payload).map_err(wrap)?;
        let event = match kind {
            EventKind::BookCreated => Self::Created(from_fields(fields).map_err(wrap)?),
            EventKind::BookBorrowed => Self::Borrowed(from_fields(fields).map_err(wrap)?),
            EventKind::BookReturned => Self::Returned(from_fields(fields).map_err(wrap)?),
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created(_) => EventKind::BookCreated,
            Self::Borrowed(_) => EventKind::BookBorrowed,
            Self::Returned(_) => EventKind::BookReturned,
        }
    }

    pub fn book_id(&self) -> i64 {
        match self {
            Self::Created(e) => e.book_id,
            Self::Borrowed(e) => e.book_id,
            Self::Returned(e) => e.book_id,
        }
    }
}

fn from_fields<T: DeserializeOwned>(fields: Map<String, Value>) -> serde_json::Result<T> {
    serde_json::from_value(Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_mapping() {
        assert_eq!(EventKind::BookCreated.queue(), "q.book.created");
        assert_eq!(EventKind::BookBorrowed.queue(), "q.book.borrowed");
        assert_eq!(EventKind::BookReturned.queue(), "q.book.returned");
    }

    #[test]
    fn test_decode_created() {
        let payload = br#"{"event":"book.created","book_id":1,"title":"Dune","author":"Herbert"}"#;
        let event = LibraryEvent::decode(EventKind::BookCreated, payload).unwrap();

        let LibraryEvent::Created(created) = &event else {
            panic!("应解码为 Created 事件");
        };
        assert_eq!(created.book_id, 1);
        assert_eq!(created.title, "Dune");
        assert_eq!(created.author, "Herbert");
        // 缺失字段取空串
        assert_eq!(created.description, "");
        assert_eq!(event.kind(), EventKind::BookCreated);
    }

    #[test]
    fn test_decode_returned_with_all_fields() {
        let payload = serde_json::json!({
            "event": "book.returned",
            "book_id": 7,
            "member_id": 42,
            "book_title": "Neuromancer",
            "member_name": "Case",
            "member_phone": "+15550100",
            "borrowed_date": "2024-01-01",
            "due_date": "2024-01-15",
            "returned_date": "2024-01-10"
        });
        let bytes = serde_json::to_vec(&payload).unwrap();

        let event = LibraryEvent::decode(EventKind::BookReturned, &bytes).unwrap();
        let LibraryEvent::Returned(returned) = event else {
            panic!("应解码为 Returned 事件");
        };
        assert_eq!(returned.member_id, 42);
        assert_eq!(returned.returned_date, "2024-01-10");
        assert_eq!(returned.member_phone, "+15550100");
    }

    #[test]
    fn test_decode_sparse_payload() {
        // 空对象结构上合法，所有字段取默认值
        let event = LibraryEvent::decode(EventKind::BookBorrowed, b"{}").unwrap();
        assert_eq!(event, LibraryEvent::Borrowed(BookBorrowed::default()));
    }

    #[test]
    fn test_decode_null_and_unknown_fields() {
        let payload = br#"{"book_id":null,"title":null,"isbn":"978-0441013593"}"#;
        let event = LibraryEvent::decode(EventKind::BookCreated, payload).unwrap();
        assert_eq!(event, LibraryEvent::Created(BookCreated::default()));
    }

    #[test]
    fn test_decode_ignores_event_field_mismatch() {
        // 事件类型由队列决定，event 字段不参与校验
        let payload = br#"{"event":"book.created","book_title":"Dune"}"#;
        let event = LibraryEvent::decode(EventKind::BookBorrowed, payload).unwrap();
        assert_eq!(event.kind(), EventKind::BookBorrowed);
    }

    #[test]
    fn test_decode_wrong_id_type_fails() {
        let err = LibraryEvent::decode(EventKind::BookCreated, br#"{"book_id":"one"}"#)
            .unwrap_err();
        assert_eq!(err.kind, EventKind::BookCreated);

        assert!(LibraryEvent::decode(EventKind::BookBorrowed, br#"{"member_id":1.5}"#).is_err());
        assert!(LibraryEvent::decode(EventKind::BookReturned, br#"{"member_id":"7"}"#).is_err());
    }

    #[test]
    fn test_decode_invalid_json_fails() {
        let truncated = br#"{"book_id":1,"book_ti"#;
        assert!(LibraryEvent::decode(EventKind::BookReturned, truncated).is_err());
        assert!(LibraryEvent::decode(EventKind::BookCreated, b"not json").is_err());
        assert!(LibraryEvent::decode(EventKind::BookCreated, b"").is_err());
    }

    #[test]
    fn test_decode_non_object_top_level_fails() {
        for payload in [
            &b"[]"[..],
            br#"["book.created",1,"Dune","Herbert"]"#,
            b"null",
            b"42",
            br#""book""#,
        ] {
            for kind in EventKind::ALL {
                let err = LibraryEvent::decode(kind, payload).unwrap_err();
                assert_eq!(err.kind, kind);
            }
        }
    }

    #[test]
    fn test_decode_duplicate_keys_keeps_last() {
        let payload = br#"{"title":"a","author":"Herbert","title":"b"}"#;
        let event = LibraryEvent::decode(EventKind::BookCreated, payload).unwrap();
        let LibraryEvent::Created(created) = event else {
            panic!("应解码为 Created 事件");
        };
        assert_eq!(created.title, "b");
        assert_eq!(created.author, "Herbert");
    }

    #[test]
    fn test_decode_key_matching_is_case_sensitive() {
        // 键名大小写不同视为未知字段，按缺失处理
        let payload = br#"{"Title":"Dune","book_title":"x"}"#;
        let event = LibraryEvent::decode(EventKind::BookCreated, payload).unwrap();
        assert_eq!(event, LibraryEvent::Created(BookCreated::default()));
    }
}
