// Capture sources for the live stream
//
// A camera id from `/video_feed?url=` resolves to one of these. Bare integers
// are local V4L2 devices, URLs and video files play through GStreamer, and a
// directory of JPEG files replays as a recorded feed.

use crate::{image::load_image, pipeline::PlateError};
use anyhow::Context;
use image::RgbImage;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};
use tracing::info;

#[cfg(feature = "gstreamer_input")]
mod gstreamer;
#[cfg(all(feature = "v4l_camera", target_os = "linux"))]
mod v4l_camera;

pub trait FrameSource: Send {
    /// Next frame, `Ok(None)` once the source is exhausted.
    fn read_frame(&mut self) -> anyhow::Result<Option<RgbImage>>;
}

/// What a camera id points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTarget {
    /// `/dev/video<N>`
    Device(u32),
    /// Anything `uridecodebin` plays: `rtsp://`, `http(s)://`, `file://`.
    Uri(String),
    Directory(PathBuf),
}

impl SourceTarget {
    pub fn describe(&self) -> String {
        match self {
            SourceTarget::Device(index) => device_path(*index),
            SourceTarget::Uri(uri) => uri.clone(),
            SourceTarget::Directory(path) => path.display().to_string(),
        }
    }
}

pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

/// Works out what a camera id refers to without opening anything.
///
/// Bare integers are device indices unless `local_camera` overrides them.
/// Strings with a scheme are URIs, except `file://` directories. Other strings
/// are paths: directories replay their JPEG files, files become `file://` URIs.
pub fn resolve_source(
    camera_id: &str,
    local_camera: Option<&str>,
) -> Result<SourceTarget, PlateError> {
    if let Ok(index) = camera_id.parse::<u32>() {
        return match local_camera {
            Some(configured) if configured != camera_id => resolve_source(configured, None),
            _ => Ok(SourceTarget::Device(index)),
        };
    }

    let unavailable = || PlateError::StreamSourceUnavailable(camera_id.to_string());

    if let Some(path) = camera_id.strip_prefix("file://") {
        let path = Path::new(path);
        if path.is_dir() {
            return Ok(SourceTarget::Directory(path.to_path_buf()));
        }
        return Ok(SourceTarget::Uri(camera_id.to_string()));
    }
    if url::Url::parse(camera_id).is_ok_and(|url| url.scheme().len() > 1) {
        return Ok(SourceTarget::Uri(camera_id.to_string()));
    }

    let path = Path::new(camera_id);
    if path.is_dir() {
        return Ok(SourceTarget::Directory(path.to_path_buf()));
    }
    if path.is_file() {
        let absolute = path.canonicalize().map_err(|_| unavailable())?;
        let uri = url::Url::from_file_path(&absolute).map_err(|_| unavailable())?;
        return Ok(SourceTarget::Uri(uri.into()));
    }
    Err(unavailable())
}

/// Opens the capture source a camera id refers to.
pub fn open_source(
    camera_id: &str,
    local_camera: Option<&str>,
) -> Result<Box<dyn FrameSource>, PlateError> {
    let target = resolve_source(camera_id, local_camera)?;
    let opened = match &target {
        SourceTarget::Device(index) => open_device(*index),
        SourceTarget::Uri(uri) => open_uri(uri),
        SourceTarget::Directory(path) => JpegDirectorySource::open(path)
            .map(|source| Box::new(source) as Box<dyn FrameSource>),
    };
    opened.map_err(|err| {
        PlateError::StreamSourceUnavailable(format!("{}: {err:#}", target.describe()))
    })
}

#[cfg(all(feature = "v4l_camera", target_os = "linux"))]
fn open_device(index: u32) -> anyhow::Result<Box<dyn FrameSource>> {
    Ok(Box::new(v4l_camera::V4lCameraSource::open(&device_path(index))?))
}

#[cfg(not(all(feature = "v4l_camera", target_os = "linux")))]
fn open_device(_index: u32) -> anyhow::Result<Box<dyn FrameSource>> {
    anyhow::bail!("local cameras need a Linux build with the `v4l_camera` feature")
}

#[cfg(feature = "gstreamer_input")]
fn open_uri(uri: &str) -> anyhow::Result<Box<dyn FrameSource>> {
    Ok(Box::new(gstreamer::GstreamerSource::open(uri)?))
}

#[cfg(not(feature = "gstreamer_input"))]
fn open_uri(_uri: &str) -> anyhow::Result<Box<dyn FrameSource>> {
    anyhow::bail!("network streams and video files need the `gstreamer_input` feature")
}

/// Converts packed YUYV 4:2:2 (BT.601) into RGB. `None` if `data` is shorter
/// than a `width` x `height` frame.
pub fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Option<RgbImage> {
    let pixels = width as usize * height as usize;
    let data = data.get(..pixels * 2)?;
    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }
    RgbImage::from_raw(width, height, rgb)
}

/// Copies packed RGB rows that start every `stride` bytes, dropping the row
/// padding video buffers carry.
pub fn rgb_from_rows(width: u32, height: u32, stride: usize, data: &[u8]) -> Option<RgbImage> {
    let row_bytes = width as usize * 3;
    if stride < row_bytes {
        return None;
    }
    let mut rgb = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        rgb.extend_from_slice(data.get(start..start + row_bytes)?);
    }
    RgbImage::from_raw(width, height, rgb)
}

/// Plays the JPEG files of a directory in file name order.
pub struct JpegDirectorySource {
    frames: VecDeque<PathBuf>,
}

impl JpegDirectorySource {
    pub fn open(directory: &Path) -> anyhow::Result<Self> {
        let mut frames = std::fs::read_dir(directory)
            .with_context(|| format!("Failed to list {directory:?}"))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy().to_lowercase();
                        ext == "jpg" || ext == "jpeg"
                    })
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        frames.sort();
        info!(?directory, frames = frames.len(), "Opened frame directory");
        Ok(Self {
            frames: frames.into(),
        })
    }
}

impl FrameSource for JpegDirectorySource {
    fn read_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
        match self.frames.pop_front() {
            Some(path) => load_image(&path)
                .with_context(|| format!("Failed to load frame {path:?}"))
                .map(Some),
            None => Ok(None),
        }
    }
}
