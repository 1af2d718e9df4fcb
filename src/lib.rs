//! Parallel CSV reading & writing.
//!
//! Both the [`Reader`] and the [`Writer`] cut their stream into numbered
//! batches, fan the CPU-bound parsing/quoting work out to a pool of worker
//! threads, and reassemble the results so the caller always observes
//! strict input order.
//!
//! Records are split on raw `\n` bytes before parsing, so quoted fields
//! containing newlines are not supported on the reading side.

mod cancel;
mod core;
mod error;
mod reader;
mod writer;

pub use error::{Error, ParseError, ParseErrorKind, Result};
pub use reader::{Reader, ReaderBuilder, RecordsIntoIter, RecordsIter};
pub use writer::{Writer, WriterBuilder};
