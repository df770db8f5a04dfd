pub mod file;

pub use file::{FileTailer, FileTailerConfig, TailError};
