//! On-disk layout of one installation's segments

use skiff_core::AppSettings;
use std::path::{Path, PathBuf};

/// Shipped (or superseded) segments
pub const ARCHIVES_DIR: &str = "archives";

/// Segments claimed by an upload in progress
pub const TMP_DIR: &str = "tmp";

/// Paths used by the writer, the uploader and the sweeps.
///
/// ```text
/// <root>/.logid
/// <root>/<installation-id>/<app>_<session-id>.log          active segment
/// <root>/<installation-id>/<app>_<session-id>.<when>.log   closed segments
/// <root>/<installation-id>/archives/
/// <root>/<installation-id>/tmp/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    root: PathBuf,
    segment_dir: PathBuf,
    base_name: String,
}

impl SegmentLayout {
    pub fn new(root: impl Into<PathBuf>, app: &AppSettings) -> Self {
        let root = root.into();
        let segment_dir = root.join(&app.installation_id);
        let base_name = format!("{}_{}", app.name, app.session_id);
        Self {
            root,
            segment_dir,
            base_name,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the active and closed segments
    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.segment_dir.join(ARCHIVES_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.segment_dir.join(TMP_DIR)
    }

    /// `<app>_<session-id>`, shared by every segment of this session
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn active_segment(&self) -> PathBuf {
        self.segment_dir.join(format!("{}.log", self.base_name))
    }

    /// Create the segment, archive and in-flight directories
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.segment_dir)?;
        std::fs::create_dir_all(self.archives_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }
}
