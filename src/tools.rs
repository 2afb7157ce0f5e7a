use crate::{
    agent::Tool,
    camera::{FrameCapturer, FrameEncoder, StreamSource},
    config::CamerasConfig,
    llm::{ContentPart, ToolOutput},
    telemetry::Metrics,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{path::Path, sync::Arc};

pub const CAPTURE_TOOL_NAME: &str = "capture_frame";

#[derive(Debug, Deserialize)]
struct CaptureArgs {
    stream_url: String,
    image_path: String,
}

/// Exposes [`FrameCapturer`] to the agent. Only the configured cameras can be
/// captured, and each one only into its own frame path.
pub struct CaptureFrameTool<S: StreamSource, E: FrameEncoder> {
    capturer: Arc<FrameCapturer<S, E>>,
    cameras: CamerasConfig,
    image_detail: String,
    metrics: Arc<Metrics>,
}

impl<S: StreamSource, E: FrameEncoder> CaptureFrameTool<S, E> {
    pub fn new(
        capturer: Arc<FrameCapturer<S, E>>,
        cameras: CamerasConfig,
        image_detail: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            capturer,
            cameras,
            image_detail,
            metrics,
        }
    }
}

#[async_trait]
impl<S: StreamSource, E: FrameEncoder> Tool for CaptureFrameTool<S, E> {
    fn name(&self) -> &str {
        CAPTURE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Captures a single frame from a camera stream, saves it to the given path \
         and returns the image so it can be inspected."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "stream_url": {
                    "type": "string",
                    "description": "The stream URL of the camera."
                },
                "image_path": {
                    "type": "string",
                    "description": "Absolute path where the frame of this camera is saved."
                }
            },
            "required": ["stream_url", "image_path"],
            "additionalProperties": false
        })
    }

    fn strict(&self) -> bool {
        true
    }

    async fn call(&self, arguments: Value) -> ToolOutput {
        let args: CaptureArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return ToolOutput::error(format!("Invalid arguments: {}", e)),
        };

        let Some(camera) = self.cameras.find_by_stream_url(&args.stream_url) else {
            tracing::warn!("Refusing capture of unknown stream {}", args.stream_url);
            return ToolOutput::error(format!("Unknown stream: {}", args.stream_url));
        };

        if Path::new(&args.image_path) != camera.frame_path {
            return ToolOutput::error(format!(
                "Frames of camera `{}` must be saved to {}",
                camera.name,
                camera.frame_path.display()
            ));
        }

        let result = self
            .capturer
            .capture(camera.stream_url.clone(), camera.frame_path.clone())
            .await;

        match result {
            Ok(image) => {
                self.metrics.record_capture(&camera.name, "ok");
                ToolOutput::Content(vec![ContentPart::InputImage {
                    image_url: image.to_data_url(),
                    detail: self.image_detail.clone(),
                }])
            }
            Err(e) => {
                self.metrics.record_capture(&camera.name, e.kind());
                ToolOutput::error(e)
            }
        }
    }
}
