use crate::{
    api::{CameraResult, PlateParts},
    assemble::AssembledPlate,
    image::jpeg_data_uri,
    render::PlateRenderer,
};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::info;

/// Latest plate reading per camera id, shared by stream producers and the
/// `/latest_result` handler.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: Mutex<HashMap<String, CameraResult>>,
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl ResultStore {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CameraResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached result for `camera_id`, or the zeroed placeholder.
    pub fn latest(&self, camera_id: &str) -> CameraResult {
        self.lock().get(camera_id).cloned().unwrap_or_default()
    }

    /// Stores `plate` for `camera_id` unless the cached text is identical.
    ///
    /// The synthetic plate is rendered without holding the lock. Returns
    /// whether the cache changed.
    pub fn publish(
        &self,
        camera_id: &str,
        plate: &AssembledPlate,
        renderer: &PlateRenderer,
    ) -> anyhow::Result<bool> {
        if self.is_current(camera_id, &plate.combined) {
            return Ok(false);
        }

        let synthetic_plate = jpeg_data_uri(&renderer.render(&plate.left, &plate.right))?;
        let result = CameraResult {
            plate_text: plate.combined.clone(),
            plate_parts: PlateParts {
                left: plate.left.clone(),
                right: plate.right.clone(),
            },
            synthetic_plate,
            timestamp: now_seconds(),
        };

        let mut results = self.lock();
        if results
            .get(camera_id)
            .is_some_and(|cached| cached.plate_text == plate.combined)
        {
            return Ok(false);
        }
        results.insert(camera_id.to_string(), result);
        drop(results);
        info!(camera_id, plate_text = %plate.combined, "Updated latest result");
        Ok(true)
    }

    fn is_current(&self, camera_id: &str, plate_text: &str) -> bool {
        self.lock()
            .get(camera_id)
            .is_some_and(|cached| cached.plate_text == plate_text)
    }
}
