pub mod analysis;
pub mod daily;
pub mod dispatcher;
pub mod domain;
pub mod fingerprint;
pub mod joined_view;
pub mod library;
pub mod memory;
pub mod ports;
pub mod session;
pub mod store;
pub mod subscription;

pub use dispatcher::{ErrorChannel, WriteDispatcher, WriteFailure, WriteKind};
pub use domain::{
    AccountCredentials, DailyVerseRecord, GeneratedDailyVerse, Identity, LibraryEntry,
    Recommendation, RecommendedVerse, ScannedVerse, UserVerseReference, VerseAnalysis,
    VerseDocument, WordAnalysis,
};
pub use joined_view::{JoinOptions, JoinedState, JoinedView, LibraryFilter};
pub use ports::{
    AccountRepository, DocumentStore, IdentityProvider, PortError, PortResult,
    VerseAnalysisService,
};
pub use session::SessionContext;
pub use store::{DocPath, Document, Query, WriteMode};
