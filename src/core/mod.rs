pub mod error;
pub mod value;

pub use error::{PoolError, Result};
pub use value::{CellType, CellValue};
