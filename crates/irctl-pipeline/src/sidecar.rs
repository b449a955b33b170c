use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use irctl_protocol::{ControlError, ControlResult, HeaderSet, HeaderWriter};
use tokio::fs;
use tracing::debug;

/// Writes header cards as `<frame>.json` beside each frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSidecarWriter;

impl JsonSidecarWriter {
    pub fn sidecar_path(frame: &Path) -> PathBuf {
        let mut path = OsString::from(frame.as_os_str());
        path.push(".json");
        PathBuf::from(path)
    }
}

#[async_trait]
impl HeaderWriter for JsonSidecarWriter {
    async fn write_headers(&self, frame: &Path, headers: &HeaderSet) -> ControlResult<()> {
        let sidecar = Self::sidecar_path(frame);
        let mut merged = match fs::read(&sidecar).await {
            Ok(bytes) => serde_json::from_slice::<HeaderSet>(&bytes).map_err(|e| {
                ControlError::Pipeline(format!("corrupt sidecar {}: {e}", sidecar.display()))
            })?,
            Err(_) => HeaderSet::new(),
        };
        merged.merge(headers);
        let body = serde_json::to_vec_pretty(&merged)
            .map_err(|e| ControlError::Pipeline(e.to_string()))?;
        fs::write(&sidecar, body).await?;
        debug!(sidecar = %sidecar.display(), cards = merged.len(), "headers written");
        Ok(())
    }

    async fn frame_moved(&self, from: &Path, to: &Path) -> ControlResult<()> {
        let source = Self::sidecar_path(from);
        if fs::metadata(&source).await.is_ok() {
            fs::rename(&source, Self::sidecar_path(to)).await?;
        }
        Ok(())
    }
}
