pub mod error;
pub mod maps;
pub mod perf;
pub mod ring;
pub mod tracer;

mod drain;

pub use error::Error;
pub use tracer::{Pid, TraceConfig, TraceSession, DEFAULT_AUX_PAGES, DEFAULT_DATA_PAGES};
