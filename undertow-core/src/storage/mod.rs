//! Persistence of download bookkeeping.
//!
//! Records which catalog entry each info-hash belongs to so that downloads
//! can be resumed, linked to the library and cleaned up later.

pub mod records;

pub use records::{
    ContentType, DownloadRecord, JsonRecordStore, MemoryRecordStore, RecordState, RecordStore,
    RecordStoreError, lookup_record,
};
