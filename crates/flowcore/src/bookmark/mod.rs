//! Bookmarks: durable suspension points
//!
//! An activity that must wait for a human action, a timer or an external
//! message records a bookmark and returns `Pending`. Whoever delivers the
//! trigger consumes the bookmark; consumption succeeds at most once.

mod store;

pub use store::{
    BookmarkRequest, BookmarkStore, ConsumeOutcome, CreateBookmarkOutcome, WORKFLOW_CLOSED_ACTOR,
};
