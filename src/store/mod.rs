pub mod file;
pub mod memory;
pub mod sessions;
pub mod traits;

pub use file::*;
pub use memory::*;
pub use sessions::*;
pub use traits::*;
