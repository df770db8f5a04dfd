pub mod console;

pub use console::{console, Encoding, WriterSink};
