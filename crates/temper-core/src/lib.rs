pub mod errors;
pub mod linear_algebra;
pub mod output;
pub mod sequences;
pub mod transport;

pub use errors::{TemperError, TemperResult};
