//! Audit trail reconstruction and export

pub mod export;
pub mod reconstructor;

pub use export::AuditExport;
pub use reconstructor::{
    AuditReconstructor, AuditTimeline, TimelineEntry, TimelineEvent, TranscriptContent,
};
