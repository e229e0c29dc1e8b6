//! Hierarchical destination selector.
//!
//! The backend returns the perimeter hierarchy (condominium, towers, floors,
//! units) as one recursive structure. The tree is immutable once loaded;
//! browsing is tracked separately by a `NavigationPath` so it can be tested
//! without any rendering layer.

pub mod client;
pub mod model;
pub mod path;

pub use client::{HttpTreeFetcher, TreeFetcher};
pub use model::{DestinationNode, DestinationTree};
pub use path::NavigationPath;
