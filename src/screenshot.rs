use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use log::warn;
use serde_json::json;

use crate::cdp::CdpError;
use crate::page::{NodeId, PageSession};

/// Overlay fill for the content box: `rgba(152, 196, 234, 0.5)`.
const CONTENT_COLOR: (u8, u8, u8, f64) = (152, 196, 234, 0.5);
/// Overlay fill for the padding box: `rgba(184, 226, 183, 0.5)`.
const PADDING_COLOR: (u8, u8, u8, f64) = (184, 226, 183, 0.5);
/// Overlay fill for the margin box: `rgba(253, 201, 148, 0.5)`.
const MARGIN_COLOR: (u8, u8, u8, f64) = (253, 201, 148, 0.5);

/// Captures viewport screenshots into the page result.
///
/// Every capture clips to the current layout viewport at scale 1, so shots
/// show exactly what a visitor would see. Highlights are drawn by the
/// browser's overlay, never by DOM mutation. Callers must hold the
/// arbiter's screenshot turn for the whole capture sequence.
pub struct ScreenshotTaker<'a> {
    page: &'a PageSession,
}

impl<'a> ScreenshotTaker<'a> {
    #[must_use]
    pub fn new(page: &'a PageSession) -> Self {
        Self { page }
    }

    /// Capture the unannotated viewport and store it under `label`.
    ///
    /// # Errors
    ///
    /// Returns the wire error if metrics or capture are rejected.
    pub async fn capture(&self, label: &str) -> Result<(), CdpError> {
        let data = self.capture_viewport().await?;
        self.page
            .with_result(|result| result.add_screenshot(label, data));
        Ok(())
    }

    /// Capture the viewport with `node` highlighted, then hide the
    /// highlight again.
    ///
    /// # Errors
    ///
    /// Returns the wire error if highlighting or capture are rejected.
    pub async fn capture_highlighted(&self, node_id: NodeId, label: &str) -> Result<(), CdpError> {
        self.highlight_node(node_id).await?;
        let outcome = self.capture(label).await;
        // best effort: a failed capture should not leave the overlay up
        let hidden = self.hide_highlight().await;
        outcome?;
        hidden
    }

    async fn capture_viewport(&self) -> Result<String, CdpError> {
        let metrics = self
            .page
            .session()
            .call("Page.getLayoutMetrics", None)
            .await?;
        let viewport = &metrics["layoutViewport"];
        let clip = json!({
            "x": viewport["pageX"],
            "y": viewport["pageY"],
            "width": viewport["clientWidth"],
            "height": viewport["clientHeight"],
            "scale": 1,
        });
        let reply = self
            .page
            .session()
            .call("Page.captureScreenshot", Some(json!({ "clip": clip })))
            .await?;
        reply["data"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                CdpError::InvalidResponse("Page.captureScreenshot reply missing data".into())
            })
    }

    async fn highlight_node(&self, node_id: NodeId) -> Result<(), CdpError> {
        self.page
            .session()
            .call(
                "Overlay.highlightNode",
                Some(json!({
                    "highlightConfig": {
                        "contentColor": rgba(CONTENT_COLOR),
                        "paddingColor": rgba(PADDING_COLOR),
                        "marginColor": rgba(MARGIN_COLOR),
                    },
                    "nodeId": node_id,
                })),
            )
            .await?;
        Ok(())
    }

    async fn hide_highlight(&self) -> Result<(), CdpError> {
        self.page.session().call("Overlay.hideHighlight", None).await?;
        Ok(())
    }
}

fn rgba((r, g, b, a): (u8, u8, u8, f64)) -> serde_json::Value {
    json!({ "r": r, "g": g, "b": b, "a": a })
}

/// Writes captured screenshots to disk as `{hostname}-{label}.png`.
#[derive(Debug, Clone)]
pub struct ScreenshotSink {
    dir: PathBuf,
}

impl ScreenshotSink {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Decode and write one screenshot.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on write failure, or `InvalidData` if the
    /// payload is not valid base64.
    pub fn write(&self, hostname: &str, label: &str, data: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(self.path_for(hostname, label), bytes)
    }

    #[must_use]
    pub fn path_for(&self, hostname: &str, label: &str) -> PathBuf {
        self.dir.join(format!("{hostname}-{label}.png"))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Flush every screenshot accumulated on a page session to the sink.
///
/// # Errors
///
/// Returns the first write error; sink failures are fatal to the run.
pub fn persist_screenshots(page: &PageSession, sink: &ScreenshotSink) -> io::Result<()> {
    let shots: Vec<(String, String)> = page.with_result(|result| {
        result
            .screenshots
            .iter()
            .map(|s| (s.label.clone(), s.data.clone()))
            .collect()
    });
    let Some(hostname) = page.hostname().map(str::to_owned) else {
        if !shots.is_empty() {
            warn!("dropping {} screenshots for a page without hostname", shots.len());
        }
        return Ok(());
    };
    for (label, data) in shots {
        sink.write(&hostname, &label, &data)?;
    }
    Ok(())
}
