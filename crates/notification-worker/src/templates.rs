//! 通知模板
//!
//! 根据事件类型生成固定标题和按固定字段顺序拼接的正文。
//! 正文格式被下游客户端按行解析，字段顺序和文案必须保持逐字节一致。

use crate::events::{EventKind, LibraryEvent};

/// 新书入库通知的收件人
///
/// 新书事件没有订阅者信息，目前统一发给占位地址。
pub const PLACEHOLDER_RECIPIENT: &str = "user@example.com";

/// 一条待投递的通知，只在一次分发过程中存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipient: String,
}

/// 事件类型对应的通知标题
pub fn render_subject(kind: EventKind) -> &'static str {
    match kind {
        EventKind::BookCreated => "New Book Added!",
        EventKind::BookBorrowed => "Book Borrowed!",
        EventKind::BookReturned => "Book Returned!",
    }
}

/// 渲染事件对应的通知
///
/// 归还通知的罚金固定为 0，当前没有罚金计算。
pub fn render(event: &LibraryEvent) -> Notification {
    let (body, recipient) = match event {
        LibraryEvent::Created(e) => (
            format!("Title: {}\nAuthor: {}", e.title, e.author),
            PLACEHOLDER_RECIPIENT.to_string(),
        ),
        LibraryEvent::Borrowed(e) => (
            format!(
                "Book: {}\nMember: {}\nDue Date: {}",
                e.book_title, e.member_name, e.due_date
            ),
            e.member_phone.clone(),
        ),
        LibraryEvent::Returned(e) => (
            format!("Book: {}\nMember: {}\nFinesDue: 0", e.book_title, e.member_name),
            e.member_phone.clone(),
        ),
    };

    Notification {
        subject: render_subject(event.kind()).to_string(),
        body,
        recipient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BookBorrowed, BookCreated, BookReturned};

    #[test]
    fn test_render_created() {
        let event = LibraryEvent::Created(BookCreated {
            event: "book.created".to_string(),
            book_id: 1,
            title: "Dune".to_string(),
            author: "Herbert".to_string(),
            description: "Desert planet".to_string(),
        });

        let notification = render(&event);
        assert_eq!(notification.subject, "New Book Added!");
        assert_eq!(notification.body, "Title: Dune\nAuthor: Herbert");
        assert_eq!(notification.recipient, "user@example.com");
    }

    #[test]
    fn test_render_borrowed() {
        let event = LibraryEvent::Borrowed(BookBorrowed {
            book_title: "Dune".to_string(),
            member_name: "Paul".to_string(),
            member_phone: "+15550123".to_string(),
            borrowed_date: "2024-03-01".to_string(),
            due_date: "2024-03-15".to_string(),
            ..Default::default()
        });

        let notification = render(&event);
        assert_eq!(notification.subject, "Book Borrowed!");
        assert_eq!(
            notification.body,
            "Book: Dune\nMember: Paul\nDue Date: 2024-03-15"
        );
        assert_eq!(notification.recipient, "+15550123");
    }

    #[test]
    fn test_render_returned_has_literal_fines() {
        let event = LibraryEvent::Returned(BookReturned {
            book_title: "Dune".to_string(),
            member_name: "Paul".to_string(),
            member_phone: "+15550123".to_string(),
            due_date: "2024-03-15".to_string(),
            returned_date: "2024-04-30".to_string(),
            ..Default::default()
        });

        let notification = render(&event);
        assert_eq!(notification.subject, "Book Returned!");
        // 逾期归还也不计算罚金
        assert_eq!(notification.body, "Book: Dune\nMember: Paul\nFinesDue: 0");
        assert_eq!(notification.recipient, "+15550123");
    }

    #[test]
    fn test_render_with_missing_fields_keeps_layout() {
        let notification = render(&LibraryEvent::Borrowed(BookBorrowed::default()));
        assert_eq!(notification.body, "Book: \nMember: \nDue Date: ");
        assert_eq!(notification.recipient, "");
    }
}
