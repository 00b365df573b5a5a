pub mod broker;
pub mod events;
pub mod outbox;
pub mod supervisor;
