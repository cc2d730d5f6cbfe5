//! Load statement generation for Hydrate.
//!
//! The [`JoinWalker`] walks an entity's association graph once, decides which
//! associations to fetch by outer join, and renders a [`LoadTemplate`]: the
//! SQL text plus the column aliases the result assembler needs.
//!
//! Templates are pure functions of the metamodel, the dialect, the session's
//! fetch influencers and the requested lock; they never touch the database.

pub mod alias;
pub mod association;
pub mod cache;
pub mod fragment;
pub mod join;
mod key_many_to_one;
pub mod template;
pub mod walker;

pub use alias::{PropertyPath, column_alias, generate_alias, qualify};
pub use association::{Association, Joinable};
pub use cache::StatementCache;
pub use join::{Join, JoinFragment, JoinType};
pub use template::{
    BatchSize, CollectionFetch, ColumnAliases, DecisionReason, EntityAliases, EntityOwner,
    JoinDecision, KeyManyToOneTarget, LoadTemplate, OwnerSlot,
};
pub use walker::{JoinWalker, JoinWalkerConfig};
