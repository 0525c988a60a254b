pub mod frame;
pub mod messages;
pub mod protocol;
