//! Bundled plugin extensions.

pub mod duplicate;
pub mod imapflags;
pub mod vacation;
