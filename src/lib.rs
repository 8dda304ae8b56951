pub mod cancel;
pub mod commands;
pub mod demangle;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod fat;
pub mod fixups;
pub mod header;
pub mod helpers;
pub mod intern;
pub mod machine;
pub mod macho;
pub mod objc;
pub mod reader;
pub mod registry;
pub mod segment;
pub mod shared_cache;
pub mod source;
pub mod swift;
pub mod translate;
pub mod typefmt;

pub use cancel::CancelToken;
pub use demangle::Demangler;
pub use driver::{process, process_cache_image, Model, ProcessContext};
pub use error::{DumpError, DumpResult};
pub use fat::{select_slice, ArchSlice};
pub use intern::{StringInterner, DEFAULT_INTERNER};
pub use macho::{ImageValue, ImageView, MachImage};
pub use shared_cache::SharedCache;
pub use source::{BufSource, ByteSource, MmapSource};
