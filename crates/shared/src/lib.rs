//! Wire types shared between the chat client core and its front-ends.

pub mod domain;
pub mod error;
pub mod protocol;
