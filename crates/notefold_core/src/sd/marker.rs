//! SD marker policy: `dev`/`prod` safety.
//!
//! Every SD carries a `SD_MARKER` file naming which kind of build wrote it.
//! A production build refuses to load a dev SD; a development build asks
//! for confirmation before touching a prod SD. The marker is written on
//! first contact, matching the running build.

use std::fmt;
use std::str::FromStr;

use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;
use crate::sd::layout::SdLayout;

/// Contents of the `SD_MARKER` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdMarker {
    /// Written by development builds.
    Dev,
    /// Written by production builds.
    Prod,
}

impl fmt::Display for SdMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdMarker::Dev => "dev",
            SdMarker::Prod => "prod",
        })
    }
}

impl FromStr for SdMarker {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "dev" => Ok(SdMarker::Dev),
            "prod" => Ok(SdMarker::Prod),
            other => Err(format!("unknown SD marker: {other:?}")),
        }
    }
}

/// What kind of build is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    /// Development build.
    Dev,
    /// Production build.
    Prod,
}

impl BuildKind {
    /// The build kind of this binary (debug assertions = dev).
    pub fn current() -> Self {
        if cfg!(debug_assertions) {
            BuildKind::Dev
        } else {
            BuildKind::Prod
        }
    }

    fn marker(&self) -> SdMarker {
        match self {
            BuildKind::Dev => SdMarker::Dev,
            BuildKind::Prod => SdMarker::Prod,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            BuildKind::Dev => "dev",
            BuildKind::Prod => "prod",
        }
    }
}

/// Enforce the marker policy for an SD being loaded.
///
/// - Marker absent (or unreadable): write the current build's marker and
///   proceed.
/// - Prod build, `dev` marker: hard refusal.
/// - Dev build, `prod` marker: `confirm_prod` decides; declining refuses.
///
/// Returns the effective marker on success.
pub fn enforce_marker(
    fs: &dyn FileSystem,
    layout: &SdLayout,
    build: BuildKind,
    confirm_prod: &dyn Fn() -> bool,
) -> Result<SdMarker> {
    let path = layout.marker_file();
    let existing = fs
        .read_to_string(&path)
        .ok()
        .and_then(|raw| raw.parse::<SdMarker>().ok());

    let Some(marker) = existing else {
        let marker = build.marker();
        fs.atomic_replace(&path, marker.to_string().as_bytes())
            .map_err(|source| NotefoldError::FileWrite {
                path: path.clone(),
                source,
            })?;
        return Ok(marker);
    };

    match (build, marker) {
        (BuildKind::Prod, SdMarker::Dev) => Err(NotefoldError::DevProdMismatch {
            path: layout.root().to_path_buf(),
            marker: marker.to_string(),
            build: build.as_str().to_string(),
        }),
        (BuildKind::Dev, SdMarker::Prod) => {
            if confirm_prod() {
                Ok(marker)
            } else {
                Err(NotefoldError::DevProdMismatch {
                    path: layout.root().to_path_buf(),
                    marker: marker.to_string(),
                    build: build.as_str().to_string(),
                })
            }
        }
        _ => Ok(marker),
    }
}
