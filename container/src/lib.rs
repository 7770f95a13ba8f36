//! easyjection-container: binding table and container driving
//! `easyjection-intercept`.

pub mod bindings;
pub mod container;

pub use bindings::{Bindings, Scope};
pub use container::Container;
