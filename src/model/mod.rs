pub mod common;
pub mod graph;
pub mod instance;
pub mod schema;

pub use common::*;
pub use graph::*;
pub use instance::*;
pub use schema::*;
