use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::detection::DetectionResult;
use crate::throttle::FrameThrottle;
use crate::vision::{Detector, VisionError};

/// Runs detection off the async runtime with at most one inference in flight.
///
/// Photos wait their turn; live frames are dropped when throttled or when the detector is busy.
#[derive(Clone)]
pub struct DetectionService {
    detector: Arc<Detector>,
    semaphore: Arc<Semaphore>,
    throttle: Arc<Mutex<FrameThrottle>>,
}

impl DetectionService {
    #[must_use]
    pub fn new(detector: Arc<Detector>) -> Self {
        let interval = detector.config().frame_interval_ms;
        Self {
            detector,
            semaphore: Arc::new(Semaphore::new(1)),
            throttle: Arc::new(Mutex::new(FrameThrottle::new(interval))),
        }
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    /// Detects food in a captured photo, waiting for any in-flight inference to finish.
    #[instrument(skip(self, image_data), fields(data_len = image_data.len()))]
    pub async fn detect_photo(&self, image_data: Vec<u8>) -> Result<DetectionResult, VisionError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| VisionError::Closed)?;

        let detector = Arc::clone(&self.detector);
        tokio::task::spawn_blocking(move || detector.detect_bytes(&image_data))
            .await
            .map_err(|e| VisionError::Processing(format!("detection task failed: {e}")))?
    }

    /// Detects food in a live RGB frame.
    ///
    /// Returns `Ok(None)` when the frame was skipped.
    #[instrument(skip(self, rgb))]
    pub async fn analyze_frame(
        &self,
        rgb: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ms: u64,
    ) -> Result<Option<DetectionResult>, VisionError> {
        if !self.lock_throttle().should_process(timestamp_ms) {
            return Ok(None);
        }

        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            debug!(timestamp_ms, "detector busy, frame dropped");
            self.lock_throttle().release(timestamp_ms);
            return Ok(None);
        };

        let detector = Arc::clone(&self.detector);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            detector.detect_rgb(rgb, width, height)
        })
        .await
        .map_err(|e| VisionError::Processing(format!("detection task failed: {e}")))??;

        Ok(Some(result))
    }

    /// Forgets the last admitted frame, e.g. after live detection is switched back on.
    pub fn reset_throttle(&self) {
        self.lock_throttle().reset();
    }

    fn lock_throttle(&self) -> std::sync::MutexGuard<'_, FrameThrottle> {
        match self.throttle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detection::RawTensor;
    use crate::imaging::tests::create_test_png;
    use crate::vision::tests::{food_labels, two_food_output, FixedEngine};
    use crate::vision::InferenceEngine;
    use ndarray::ArrayView4;
    use std::sync::mpsc;

    fn config() -> DetectorConfig {
        DetectorConfig {
            input_width: 16,
            input_height: 16,
            ..Default::default()
        }
    }

    fn service() -> DetectionService {
        let detector =
            Detector::with_engine(config(), Box::new(FixedEngine::new(two_food_output())), food_labels())
                .unwrap();
        DetectionService::new(Arc::new(detector))
    }

    /// Blocks inside `run` until the test lets it go.
    struct GatedEngine {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl InferenceEngine for GatedEngine {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn run(&mut self, _input: ArrayView4<'_, f32>) -> Result<RawTensor, VisionError> {
            let _ = self.started.send(());
            let _ = self.release.recv();
            Ok(two_food_output())
        }
    }

    #[tokio::test]
    async fn photo_detection_runs_off_thread() {
        let service = service();
        let result = service.detect_photo(create_test_png(40, 40)).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn frames_are_throttled() {
        let service = service();
        let frame = vec![0u8; 4 * 4 * 3];

        let first = service.analyze_frame(frame.clone(), 4, 4, 1_000).await.unwrap();
        assert!(first.is_some());

        let skipped = service.analyze_frame(frame.clone(), 4, 4, 1_200).await.unwrap();
        assert!(skipped.is_none());

        let second = service.analyze_frame(frame.clone(), 4, 4, 1_500).await.unwrap();
        assert!(second.is_some());

        service.reset_throttle();
        assert!(service.analyze_frame(frame, 4, 4, 1_600).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_detector_is_an_error_not_an_empty_result() {
        let service = DetectionService::new(Arc::new(Detector::new(config())));
        let result = service.analyze_frame(vec![0; 12], 2, 2, 0).await;
        assert!(matches!(result, Err(VisionError::NotReady { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_are_dropped_while_busy() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let engine = GatedEngine {
            started: started_tx,
            release: release_rx,
        };
        let detector = Detector::with_engine(config(), Box::new(engine), food_labels()).unwrap();
        let service = DetectionService::new(Arc::new(detector));

        let in_flight = {
            let service = service.clone();
            tokio::spawn(async move { service.detect_photo(create_test_png(8, 8)).await })
        };
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let dropped = service.analyze_frame(vec![0; 12], 2, 2, 5_000).await.unwrap();
        assert!(dropped.is_none());

        release_tx.send(()).unwrap();
        assert_eq!(in_flight.await.unwrap().unwrap().len(), 2);

        // the dropped frame did not consume the throttle slot
        release_tx.send(()).unwrap();
        let admitted = service.analyze_frame(vec![0; 12], 2, 2, 5_001).await.unwrap();
        assert!(admitted.is_some());
    }
}
