pub mod fjall;
pub mod keys;
pub mod mem;
pub mod procedures;
pub mod traits;
pub mod types;

#[cfg(test)]
mod fixtures;

pub use self::fjall::{FjallBackend, FjallStore};
pub use mem::MemBackend;
pub use traits::{QueryBackend, RowStore};
pub use types::{MemberKey, MemberRow, Mutation, ReminderKey, ReminderRow, SuspectRow, VersionRow};
