//! User-data ingestion
//!
//! Raw user-data goes through three steps:
//! 1. [`parse_document`] builds a part tree from the blob (MIME multipart,
//!    gzip, base64 or a bare script/config);
//! 2. [`UserDataProcessor`] flattens it, resolving includes, archives,
//!    templates and encrypted parts;
//! 3. [`Dispatcher`] hands each part to its registered handler.

pub mod dispatch;
pub mod document;
pub mod handlers;
pub mod include;
pub mod mime;
pub mod process;
pub mod types;

pub use dispatch::{Dispatcher, WalkSummary};
pub use document::{Document, Part, parse_document};
pub use handlers::{DataOrigin, Frequency, HandlerRegistry, HandlerSpec, PartHandler};
pub use include::{Fetcher, HttpFetcher, IncludeCache};
pub use process::UserDataProcessor;
pub use types::ContentType;
