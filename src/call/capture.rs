//! Audio Capture - Mikrofon-Zugriff für Anrufe
//!
//! `MediaCapture` liefert einen laufenden Audiostrom, der beim Auflegen
//! wieder freigegeben wird. Mit dem Feature `native-audio` gibt es eine
//! cpal-Implementierung für das Standard-Eingabegerät.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone access denied")]
    PermissionDenied,

    #[error("No audio input device available")]
    DeviceUnavailable,

    #[error("Audio stream error: {0}")]
    Stream(String),
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Gewünschte Eigenschaften der Aufnahme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48_000,
        }
    }
}

/// Laufender lokaler Audiostrom
pub trait CaptureStream: Send + Sync {
    fn id(&self) -> &str;

    /// Gibt das Gerät frei; mehrfacher Aufruf ist erlaubt
    fn stop(&self);

    fn is_live(&self) -> bool;
}

/// Zugriff auf das Mikrofon
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire_audio(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Box<dyn CaptureStream>, MediaError>;
}

// ============================================================================
// CPAL CAPTURE
// ============================================================================

#[cfg(feature = "native-audio")]
pub use native::CpalCapture;

#[cfg(feature = "native-audio")]
mod native {
    use super::{AudioConstraints, CaptureStream, MediaCapture, MediaError};
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BuildStreamError, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use tokio::sync::oneshot;

    /// Mikrofon über cpal
    ///
    /// `cpal::Stream` ist nicht `Send`, daher lebt der Stream auf einem
    /// eigenen Thread, bis `stop()` aufgerufen oder der Handle gedroppt wird.
    #[derive(Debug, Default, Clone)]
    pub struct CpalCapture;

    impl CpalCapture {
        pub fn new() -> Self {
            Self
        }
    }

    struct CpalStream {
        id: String,
        stop_tx: Mutex<Option<mpsc::Sender<()>>>,
        live: Arc<AtomicBool>,
        level: Arc<Mutex<f32>>,
    }

    impl CpalStream {
        /// Aktueller Eingangspegel (RMS, 0.0 - 1.0)
        fn level(&self) -> f32 {
            *self.level.lock()
        }
    }

    impl CaptureStream for CpalStream {
        fn id(&self) -> &str {
            &self.id
        }

        fn stop(&self) {
            if let Some(tx) = self.stop_tx.lock().take() {
                let _ = tx.send(());
                self.live.store(false, Ordering::SeqCst);
                tracing::info!(
                    "Audio capture {} stopped (last level {:.2})",
                    self.id,
                    self.level()
                );
            }
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.stop();
        }
    }

    #[async_trait]
    impl MediaCapture for CpalCapture {
        async fn acquire_audio(
            &self,
            constraints: &AudioConstraints,
        ) -> Result<Box<dyn CaptureStream>, MediaError> {
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let live = Arc::new(AtomicBool::new(false));
            let level = Arc::new(Mutex::new(0.0f32));
            let target_rate = constraints.sample_rate;

            let thread_live = Arc::clone(&live);
            let thread_level = Arc::clone(&level);
            std::thread::Builder::new()
                .name("roomcall-capture".to_string())
                .spawn(move || match open_input_stream(target_rate, thread_level) {
                    Ok(stream) => {
                        thread_live.store(true, Ordering::SeqCst);
                        let _ = ready_tx.send(Ok(()));
                        // Blockiert bis stop() oder Drop des Senders
                        let _ = stop_rx.recv();
                        drop(stream);
                        thread_live.store(false, Ordering::SeqCst);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| MediaError::Stream(e.to_string()))?;

            ready_rx
                .await
                .map_err(|_| MediaError::Stream("capture thread exited".to_string()))??;

            let id = uuid::Uuid::new_v4().to_string();
            tracing::info!("Audio capture {} started at {} Hz", id, target_rate);
            Ok(Box::new(CpalStream {
                id,
                stop_tx: Mutex::new(Some(stop_tx)),
                live,
                level,
            }))
        }
    }

    fn open_input_stream(target_rate: u32, level: Arc<Mutex<f32>>) -> Result<Stream, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MediaError::DeviceUnavailable)?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::Stream(e.to_string()))?;
        let config = select_best_config(configs.collect(), target_rate)?;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if data.is_empty() {
                        return;
                    }
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *level.lock() = rms.min(1.0);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                BuildStreamError::DeviceNotAvailable => MediaError::DeviceUnavailable,
                other => MediaError::Stream(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| MediaError::Stream(e.to_string()))?;
        Ok(stream)
    }

    /// Wählt die beste Konfiguration: Zielrate mit F32, dann irgendeine F32
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
        target_rate: u32,
    ) -> Result<StreamConfig, MediaError> {
        let target = cpal::SampleRate(target_rate);

        for config in &configs {
            if config.min_sample_rate() <= target
                && config.max_sample_rate() >= target
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target).into());
            }
        }

        configs
            .iter()
            .find(|c| c.sample_format() == SampleFormat::F32)
            .map(|c| c.with_max_sample_rate().into())
            .ok_or(MediaError::DeviceUnavailable)
    }
}
