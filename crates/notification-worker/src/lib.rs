//! 图书馆通知服务
//!
//! 消费图书入库、借出、归还三个事件队列，渲染通知后依次投递到邮件和短信渠道。
//! 解码失败的消息拒绝且不重新入队；渠道投递失败只记录，不影响消息确认。

pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod sender;
pub mod templates;
pub mod worker;
