//! Snapshot, restore and multi-range transfer.
//!
//! Each phase leaves an inspectable artifact: the source writes data units
//! and a manifest under the shared snapshot root, and the destination reads
//! nothing but that manifest and the files it lists.

pub mod export;
pub mod fetch;
pub mod manifest;
pub mod restore;
pub mod source;

pub use export::{content_hash, decode_rows, encode_rows, export_tables};
pub use fetch::{
    fetch_files, fetch_with_retry, snapshot_file_path, FaultInjector, FetchRetry, LocalFetcher, RpcFetcher,
    SnapshotFetcher,
};
pub use manifest::{
    default_manifest_path, multi_index_path, tablet_dir, MultiSnapshotIndex, SnapshotFile, SnapshotManifest,
    MULTI_INDEX, PARTIAL_MANIFEST, SNAPSHOT_MANIFEST,
};
pub use restore::{multi_restore, partial_restore, restore};
pub use source::{multi_snapshot, partial_snapshot, snapshot, snapshot_source_end, validate_snapshot_dir};
