pub mod error;
pub mod codec;
pub mod crypto;
pub mod io_stream;
pub mod header;
pub mod block;
pub mod index;
pub mod blob;
pub mod value;
pub mod document;

pub use error::{PxError, Result, Severity, Warning};
pub use header::{FieldSpec, FieldType, FileType, Header};
pub use block::DataBlockHeader;
pub use index::{IndexEntry, PrimaryIndex};
pub use blob::{BlobDescriptor, BlobStore};
pub use value::Value;
pub use document::{CreateOptions, Document, OpenOptions};
