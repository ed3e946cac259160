use super::{FrameSource, yuyv_to_rgb};
use crate::image::decode_image;
use anyhow::{Context, anyhow};
use image::RgbImage;
use std::pin::Pin;
use tracing::info;
use v4l::{
    FourCC,
    buffer::Type,
    io::{mmap::Stream, traits::CaptureStream},
    prelude::*,
    video::Capture,
};

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;

/// Local V4L2 camera, asked for 640x480 YUYV. Drivers that only offer
/// Motion-JPEG are decoded per frame.
pub struct V4lCameraSource {
    device_path: String,
    // Borrows `device`, so it is declared first and dropped first.
    stream: Stream<'static>,
    _device: Pin<Box<Device>>,
    width: u32,
    height: u32,
    fourcc: FourCC,
}

impl V4lCameraSource {
    pub fn open(device_path: &str) -> anyhow::Result<Self> {
        let device = Box::pin(
            Device::with_path(device_path)
                .with_context(|| format!("Failed to open {device_path}"))?,
        );

        let mut format = device.format()?;
        format.width = CAPTURE_WIDTH;
        format.height = CAPTURE_HEIGHT;
        format.fourcc = FourCC::new(b"YUYV");
        let format = device
            .set_format(&format)
            .with_context(|| format!("Failed to set capture format on {device_path}"))?;

        // SAFETY: the device lives on the heap behind `Pin`, is never moved or
        // handed out, and `stream` is dropped before it.
        let device_ref: &'static Device = unsafe { &*(&*device as *const Device) };
        let stream = Stream::with_buffers(device_ref, Type::VideoCapture, BUFFER_COUNT)
            .with_context(|| format!("Failed to start capture on {device_path}"))?;

        info!(
            device_path,
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "Opened V4L2 camera"
        );
        Ok(Self {
            device_path: device_path.to_string(),
            stream,
            _device: device,
            width: format.width,
            height: format.height,
            fourcc: format.fourcc,
        })
    }
}

impl FrameSource for V4lCameraSource {
    fn read_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
        let (buffer, meta) = CaptureStream::next(&mut self.stream)
            .with_context(|| format!("Failed to capture from {}", self.device_path))?;
        let used = (meta.bytesused as usize).min(buffer.len());
        let data = &buffer[..used];

        if self.fourcc == FourCC::new(b"YUYV") {
            yuyv_to_rgb(self.width, self.height, data)
                .map(Some)
                .ok_or_else(|| anyhow!("Short YUYV frame from {}", self.device_path))
        } else if self.fourcc == FourCC::new(b"MJPG") {
            decode_image(data).map(Some)
        } else {
            anyhow::bail!("{} delivers unsupported format {}", self.device_path, self.fourcc)
        }
    }
}
