//! Build failure kinds.
//!
//! Every fallible function in this crate returns [`anyhow::Result`] and
//! decorates failures with path context. The kinds below are the ones a
//! caller may want to tell apart; recover them with
//! `err.downcast_ref::<Error>()`.

use std::path::PathBuf;

/// Failure kinds surfaced by the build pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required asset glob matched nothing.
    #[error("no asset matching '{pattern}' in {}", dir.display())]
    AssetNotFound { dir: PathBuf, pattern: String },

    /// An asset glob that must match at most once matched several files.
    #[error("expected one asset matching '{pattern}' in {}, found {}", dir.display(), matches.len())]
    AmbiguousAsset {
        dir: PathBuf,
        pattern: String,
        matches: Vec<PathBuf>,
    },

    /// Unpacking or mounting a disk image failed.
    #[error("extracting {}: {reason}", image.display())]
    Extraction { image: PathBuf, reason: String },

    /// The ISO build tool failed.
    #[error("composing {}: {reason}", output.display())]
    Compose { output: PathBuf, reason: String },

    /// No driver version tag is known for this Windows version.
    #[error("unsupported windows version '{0}' for driver resolution")]
    UnsupportedVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_asset_reports_match_count() {
        let err = Error::AmbiguousAsset {
            dir: PathBuf::from("/assets"),
            pattern: "Win11*.iso".into(),
            matches: vec!["/assets/a.iso".into(), "/assets/b.iso".into()],
        };
        assert_eq!(
            err.to_string(),
            "expected one asset matching 'Win11*.iso' in /assets, found 2"
        );
    }

    #[test]
    fn kind_survives_anyhow_context() {
        use anyhow::Context;

        let result: anyhow::Result<()> =
            Err(Error::UnsupportedVersion("w10".into())).context("resolving drivers");
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedVersion(v)) if v == "w10"
        ));
    }
}
