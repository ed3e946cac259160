use super::{FrameSource, rgb_from_rows};
use anyhow::{Context, anyhow, bail};
use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, info, warn};

const PIPELINE: &str = "uridecodebin name=source ! videoconvert ! video/x-raw,format=RGB \
                        ! appsink name=sink max-buffers=2 sync=false";
const START_TIMEOUT_SECONDS: u64 = 10;

/// Plays any URI `uridecodebin` understands and hands out RGB frames from an
/// appsink.
pub struct GstreamerSource {
    uri: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GstreamerSource {
    pub fn open(uri: &str) -> anyhow::Result<Self> {
        gst::init()?;

        let pipeline = gst::parse::launch(PIPELINE)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("Failed to create pipeline"))?;
        // Set as a property so the URI is never parsed as pipeline syntax.
        pipeline
            .by_name("source")
            .ok_or_else(|| anyhow!("Pipeline has no decoder"))?
            .set_property("uri", uri);
        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| anyhow!("Failed to get appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| anyhow!("Failed to convert element to appsink"))?;

        let source = Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
        };
        source
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|_| source.pipeline_error())?;
        let (started, _, _) = source
            .pipeline
            .state(gst::ClockTime::from_seconds(START_TIMEOUT_SECONDS));
        started.map_err(|_| source.pipeline_error())?;

        info!(uri, "Opened GStreamer source");
        Ok(source)
    }

    /// The error the pipeline posted on its bus, if any.
    fn pipeline_error(&self) -> anyhow::Error {
        let message = self
            .pipeline
            .bus()
            .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]));
        match message.as_ref().map(|message| message.view()) {
            Some(gst::MessageView::Error(err)) => {
                anyhow!("{} ({:?})", err.error(), err.debug())
            }
            _ => anyhow!("Pipeline for {} failed to start", self.uri),
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop GStreamer pipeline: {}", e);
        }
    }
}

impl FrameSource for GstreamerSource {
    fn read_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
        match self.appsink.pull_sample() {
            Ok(sample) => sample_to_image(&sample).map(Some),
            Err(_) if self.appsink.is_eos() => {
                debug!(uri = %self.uri, "GStreamer source reached end of stream");
                Ok(None)
            }
            Err(_) => Err(self.pipeline_error()),
        }
    }
}

fn sample_to_image(sample: &gst::Sample) -> anyhow::Result<RgbImage> {
    let buffer = sample.buffer().context("No buffer in sample")?;
    let caps = sample.caps().context("No caps in sample")?;
    let video_info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|_| anyhow!("Failed to get video info from caps"))?;
    if video_info.format() != gst_video::VideoFormat::Rgb {
        bail!("Unsupported video format {:?}", video_info.format());
    }

    let map = buffer
        .map_readable()
        .map_err(|e| anyhow!("Failed to map buffer for reading: {}", e))?;
    let stride = usize::try_from(video_info.stride()[0])?;
    rgb_from_rows(video_info.width(), video_info.height(), stride, map.as_slice()).ok_or_else(
        || {
            anyhow!(
                "Buffer of {} bytes too small for {}x{} RGB",
                map.as_slice().len(),
                video_info.width(),
                video_info.height()
            )
        },
    )
}
