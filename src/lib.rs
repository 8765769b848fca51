//! # cookvfs — compressed, optionally encrypted, content-addressed VFS archive
//!
//! Format guarantees:
//! - All multi-byte integers in this crate's own structures are big-endian.
//! - A page is `[compression:1][bytes...]`; an encrypted page prefixes the
//!   compressed bytes with a 16-byte IV and pads to a block boundary with
//!   PKCS-style padding.
//! - The archive trailer is exactly 16 bytes: pgindex length, page count,
//!   a compression tag, and a 7-byte signature (`CFS0002` plain,
//!   `CFS0004` encryption-capable).
//! - The fsindex blob leads with its own `CFS2.200` marker.
//! - Dedup key is `(uncompressed size, MD5)`; disabled whenever any page
//!   in the store is encrypted.

pub mod archive;
pub mod channel;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod fsindex;
pub mod hash;
pub mod page_obj;
pub mod pages;
pub mod path;
pub mod pgindex;
pub mod rwlock;
pub mod writer;

pub use archive::{Mount, MountOptions};
pub use codec::{CompressionType, CustomCodec};
pub use error::{CookfsError, Result};
pub use fsindex::{Block, FsEntry, FsIndex};
pub use page_obj::PageBuf;
pub use pages::{CompressionPipeline, KeyMode, Pages, PagesOptions};
pub use path::PathObj;
