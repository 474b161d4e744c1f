//! Frame sources: where preload jobs get their bytes.
//!
//! [`HttpFrameSource`] speaks the frame retrieval protocol:
//! - `GET {base}/studies/{st}/series/{se}/instances/{sop}/frames/{1,2,3}` answers
//!   `multipart/related; boundary=...`, parsed incrementally while the body
//!   is read,
//! - `GET {base}/studies/{st}/series/{se}/instances/{sop}/preview?resolution=N`
//!   answers a JSON document with base64 frames (preview tier only).
//!
//! Auth/tenant headers are the embedding application's concern; a prepared
//! `reqwest` client can be injected with [`HttpFrameSource::with_client`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, trace, warn};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

use crate::core::multipart::{FramePart, MultipartStream, boundary_from_content_type};
use crate::entities::InstanceRef;
use crate::error::{EngineError, Result};

const MULTIPART_ACCEPT: &str = "multipart/related; type=\"application/octet-stream\"; transfer-syntax=*";
const READ_CHUNK: usize = 64 * 1024;

/// What a preload job asks a source for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRequest {
    /// Listed 1-based frames in one multipart response
    Frames(Vec<u32>),
    /// Every frame of the instance, pre-scaled by the server (preview tier)
    WholeInstance { resolution: u32 },
}

impl FrameRequest {
    /// Frames this request is expected to yield for `instance`.
    pub fn expected(&self, instance: &InstanceRef) -> usize {
        match self {
            Self::Frames(list) => list.len(),
            Self::WholeInstance { .. } => instance.frame_count,
        }
    }
}

/// Split an instance into fixed-size runs of frame numbers.
pub fn frame_batches(instance: &InstanceRef, batch_size: usize) -> Vec<FrameRequest> {
    let numbers: Vec<u32> = instance.frame_numbers().collect();
    numbers
        .chunks(batch_size.max(1))
        .map(|c| FrameRequest::Frames(c.to_vec()))
        .collect()
}

/// Blocking byte source for preload jobs. Runs on worker threads.
pub trait FrameSource: Send + Sync {
    fn fetch(&self, instance: &InstanceRef, request: &FrameRequest) -> Result<Vec<FramePart>>;

    /// Whether `WholeInstance` requests are served.
    fn supports_whole_instance(&self) -> bool {
        false
    }
}

/// Whole-instance preview document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewDocument {
    sop_instance_uid: String,
    number_of_frames: usize,
    #[serde(default)]
    resolution: Option<u32>,
    frames: Vec<String>,
}

/// HTTP implementation over a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFrameSource {
    client: Client,
    base_url: String,
    whole_instance: bool,
}

impl HttpFrameSource {
    /// Build a source. `timeout` bounds each request; None leaves it to the caller's watchdog.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        Ok(Self::with_client(builder.build()?, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            whole_instance: true,
        }
    }

    /// Enable/disable the JSON whole-instance preview endpoint.
    pub fn with_whole_instance(mut self, enabled: bool) -> Self {
        self.whole_instance = enabled;
        self
    }

    fn instance_url(&self, instance: &InstanceRef) -> String {
        format!(
            "{}/studies/{}/series/{}/instances/{}",
            self.base_url, instance.study_id, instance.series_id, instance.sop_instance_id
        )
    }

    pub fn frames_url(&self, instance: &InstanceRef, frames: &[u32]) -> String {
        let list: Vec<String> = frames.iter().map(u32::to_string).collect();
        format!("{}/frames/{}", self.instance_url(instance), list.join(","))
    }

    pub fn preview_url(&self, instance: &InstanceRef, resolution: u32) -> String {
        format!("{}/preview?resolution={}", self.instance_url(instance), resolution)
    }

    fn fetch_multipart(&self, url: &str) -> Result<Vec<FramePart>> {
        let mut response = self.client.get(url).header(ACCEPT, MULTIPART_ACCEPT).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Status { status: status.as_u16(), url: url.to_string() });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = boundary_from_content_type(&content_type).ok_or_else(|| {
            EngineError::protocol(format!("no boundary in content type {:?} from {}", content_type, url))
        })?;

        let mut stream = MultipartStream::new(&boundary);
        let mut parts = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            parts.extend(stream.push(&buf[..n]));
            if stream.is_done() {
                break;
            }
        }
        parts.extend(stream.finish());

        trace!("GET {} -> {} parts", url, parts.len());
        Ok(parts)
    }

    fn fetch_preview(&self, instance: &InstanceRef, resolution: u32) -> Result<Vec<FramePart>> {
        let url = self.preview_url(instance, resolution);
        let response = self.client.get(&url).header(ACCEPT, "application/json").send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Status { status: status.as_u16(), url });
        }

        let doc: PreviewDocument = response
            .json()
            .map_err(|e| EngineError::protocol(format!("bad preview document from {}: {}", url, e)))?;

        if doc.sop_instance_uid != instance.sop_instance_id {
            warn!(
                "Preview document for {} answered with uid {}",
                instance.sop_instance_id, doc.sop_instance_uid
            );
        }
        if doc.number_of_frames != doc.frames.len() {
            debug!(
                "Preview document declares {} frames, carries {}",
                doc.number_of_frames,
                doc.frames.len()
            );
        }
        trace!("Preview {} at resolution {:?}", doc.sop_instance_uid, doc.resolution);

        Ok(decode_preview_frames(doc.frames))
    }
}

/// Base64 frame list to parts; undecodable entries are skipped.
fn decode_preview_frames(frames: Vec<String>) -> Vec<FramePart> {
    frames
        .into_iter()
        .enumerate()
        .filter_map(|(i, encoded)| {
            let frame_number = i as u32 + 1;
            // Tolerate data-URL prefixes
            let payload = encoded.rsplit_once(',').map(|(_, p)| p).unwrap_or(&encoded);
            match BASE64.decode(payload.trim()) {
                Ok(bytes) => {
                    let content_type = image::guess_format(&bytes)
                        .map(|f| f.to_mime_type().to_string())
                        .unwrap_or_else(|_| "application/octet-stream".to_string());
                    Some(FramePart { frame_number, bytes, content_type, codec_id: None })
                }
                Err(e) => {
                    debug!("Skipping preview frame {}: {}", frame_number, e);
                    None
                }
            }
        })
        .collect()
}

impl FrameSource for HttpFrameSource {
    fn fetch(&self, instance: &InstanceRef, request: &FrameRequest) -> Result<Vec<FramePart>> {
        match request {
            FrameRequest::Frames(list) => self.fetch_multipart(&self.frames_url(instance, list)),
            FrameRequest::WholeInstance { resolution } => self.fetch_preview(instance, *resolution),
        }
    }

    fn supports_whole_instance(&self) -> bool {
        self.whole_instance
    }
}

/// In-process source for tests: synthesizes PNG frames, optionally gated.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::entities::raster::test_png;
    use crossbeam_channel::{Receiver, Sender};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeSource {
        /// When set, every `Frames` fetch waits for one token
        gate: Option<Receiver<()>>,
        pub fetches: AtomicUsize,
        pub fail: AtomicBool,
        pub whole_instance: bool,
        /// Frame numbers answered with undecodable bytes
        pub corrupt: Mutex<HashSet<u32>>,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn gated() -> (Self, Sender<()>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            (Self { gate: Some(rx), ..Self::default() }, tx)
        }

        pub fn with_whole_instance(mut self) -> Self {
            self.whole_instance = true;
            self
        }

        fn part(&self, n: u32) -> FramePart {
            let bytes = if self.corrupt.lock().unwrap().contains(&n) {
                b"corrupt".to_vec()
            } else {
                test_png(4, 4, n as u8)
            };
            FramePart { frame_number: n, bytes, content_type: "image/png".into(), codec_id: None }
        }
    }

    impl FrameSource for FakeSource {
        fn fetch(&self, instance: &InstanceRef, request: &FrameRequest) -> Result<Vec<FramePart>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let numbers: Vec<u32> = match request {
                FrameRequest::Frames(list) => {
                    if let Some(gate) = &self.gate {
                        gate.recv_timeout(Duration::from_secs(10))
                            .map_err(|_| EngineError::Transport("gate timeout".into()))?;
                    }
                    list.clone()
                }
                FrameRequest::WholeInstance { .. } => instance.frame_numbers().collect(),
            };
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Status { status: 503, url: "fake://".into() });
            }
            Ok(numbers.into_iter().map(|n| self.part(n)).collect())
        }

        fn supports_whole_instance(&self) -> bool {
            self.whole_instance
        }
    }
}
