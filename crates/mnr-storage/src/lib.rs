//! Page fetching, raw page archive and the document store used by the sync pipeline.

mod archive;
mod documents;
mod fetch;

pub use archive::{ArchivedPage, PageArchive};
pub use documents::{
    load_document, save_document, ChangeFeed, DocumentChange, DocumentStore, FsDocumentStore,
    MemoryDocumentStore, PgDocumentStore, StoreError,
};
pub use fetch::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, PageSource, ProxyCredentials,
    USER_AGENTS,
};

pub const CRATE_NAME: &str = "mnr-storage";
