//! Collection name constants.

/// Discussion threads.
pub const THREADS_COLLECTION: &str = "threads";

/// Comments posted on threads.
pub const COMMENTS_COLLECTION: &str = "comments";

/// Personal rich-text notebooks.
pub const NOTEBOOKS_COLLECTION: &str = "notebooks";

/// Shared code playgrounds.
pub const PLAYGROUNDS_COLLECTION: &str = "playgrounds";

/// Scratchpads attached to a thread or notebook.
pub const SCRATCHPADS_COLLECTION: &str = "scratchpads";

/// Auth collection of users.
pub const USERS_COLLECTION: &str = "users";

/// All collections known to the schema.
pub const ALL_COLLECTIONS: &[&str] = &[
    THREADS_COLLECTION,
    COMMENTS_COLLECTION,
    NOTEBOOKS_COLLECTION,
    PLAYGROUNDS_COLLECTION,
    SCRATCHPADS_COLLECTION,
    USERS_COLLECTION,
];
