pub mod content_pool;
pub mod dead_letter_message;
pub mod event_log;
pub mod namespace_link;
pub mod share_record;
