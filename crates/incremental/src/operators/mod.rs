//! Pipeline operators.
//!
//! - Take: limit, optionally per partition
//! - Join: attaches child nodes to parents as a named relationship
//! - Filter: passes through rows matching a predicate

mod filter;
mod join;
mod take;

pub use filter::Filter;
pub use join::{Join, JoinArgs};
pub use take::Take;
