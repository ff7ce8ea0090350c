//! Message types shared between pipeline components.

pub mod messages;
