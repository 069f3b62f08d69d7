pub mod coerce;
pub mod describe;
pub mod engine;
pub mod lookup;
pub mod registry;

pub use coerce::*;
pub use describe::*;
pub use engine::*;
pub use lookup::*;
pub use registry::*;
