//! Backend-neutral export and import.
//!
//! A dump is a portable binary copy of a [`FullSnapshot`](crate::FullSnapshot)
//! that either backend can produce and consume, independent of the on-disk
//! format of the store it came from.
//!
//! # Examples
//!
//! ```rust,ignore
//! use intellistore::io::{read_dump_file, write_dump_file};
//! use intellistore::Codec;
//!
//! let codec = Codec::new(384);
//! let written = write_dump_file("state.isdump", &store.load_all()?, &codec)?;
//! let loaded = read_dump_file("state.isdump", &codec)?;
//! assert_eq!(loaded.skipped, 0);
//! ```

mod dump;

pub use dump::{
    DUMP_MAGIC, DUMP_VERSION, LoadedDump, read_dump, read_dump_file, write_dump, write_dump_file,
};
