pub mod fanout;
pub mod membership;
pub mod messages;
pub mod presence;
pub mod unread;
