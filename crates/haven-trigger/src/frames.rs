use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

use crate::error::TriggerError;

/// Supplies the most recent frame sequence for a camera channel, oldest
/// frame first. Backed by whatever NVR or camera API the deployment has;
/// the scheduler only sees bytes.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn latest_frames(
        &self,
        camera_id: &str,
        channel: u32,
    ) -> Result<Vec<Bytes>, TriggerError>;
}

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SNAPSHOT_COUNT: usize = 2;
const DEFAULT_SNAPSHOT_GAP: Duration = Duration::from_millis(400);

/// Snapshot-endpoint frame source. The URL template carries `{camera_id}`
/// and `{channel}` placeholders; each fetch takes `count` snapshots spaced
/// `gap` apart so the motion gate has a first and a last frame to compare.
pub struct SnapshotFrameSource {
    client: reqwest::Client,
    url_template: String,
    count: usize,
    gap: Duration,
}

impl SnapshotFrameSource {
    pub fn new(url_template: impl Into<String>) -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()
            .map_err(|e| TriggerError::FrameFetch(e.to_string()))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            count: DEFAULT_SNAPSHOT_COUNT,
            gap: DEFAULT_SNAPSHOT_GAP,
        })
    }

    fn url_for(&self, camera_id: &str, channel: u32) -> String {
        self.url_template
            .replace("{camera_id}", camera_id)
            .replace("{channel}", &channel.to_string())
    }

    async fn fetch_one(&self, url: &str) -> Result<Bytes, TriggerError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TriggerError::FrameFetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TriggerError::FrameFetch(format!(
                "snapshot returned {} for {url}",
                resp.status()
            )));
        }
        resp.bytes()
            .await
            .map_err(|e| TriggerError::FrameFetch(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for SnapshotFrameSource {
    #[instrument(skip(self))]
    async fn latest_frames(
        &self,
        camera_id: &str,
        channel: u32,
    ) -> Result<Vec<Bytes>, TriggerError> {
        let url = self.url_for(camera_id, channel);
        let mut frames = Vec::with_capacity(self.count);
        for i in 0..self.count {
            if i > 0 {
                tokio::time::sleep(self.gap).await;
            }
            frames.push(self.fetch_one(&url).await?);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_substitution() {
        let source =
            SnapshotFrameSource::new("http://nvr.local/snap/{camera_id}/{channel}.jpg").unwrap();
        assert_eq!(
            source.url_for("cam_front", 2),
            "http://nvr.local/snap/cam_front/2.jpg"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_frame_fetch_error() {
        let source = SnapshotFrameSource::new("http://127.0.0.1:1/snap/{camera_id}/{channel}")
            .unwrap();
        let err = source.latest_frames("cam_front", 0).await.unwrap_err();
        assert!(matches!(err, TriggerError::FrameFetch(_)));
    }
}
