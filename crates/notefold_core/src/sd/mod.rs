//! Storage-directory tier: layout, identity files, marker policy, and the
//! per-SD orchestrator.

pub mod idfile;
pub mod layout;
mod manager;
pub mod marker;

pub use idfile::{read_or_create_sd_id, read_or_create_version, CURRENT_SD_VERSION};
pub use layout::SdLayout;
pub use manager::{SdContext, SdManager};
pub use marker::{enforce_marker, BuildKind, SdMarker};
