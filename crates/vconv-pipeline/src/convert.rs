//! Conversion entry points.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};
use vconv_core::{ConvertError, MediaLocator, Result};

use crate::backend::{Backend, NativeBackend};
use crate::cancel::CancelToken;
use crate::config::ConverterConfig;
use crate::coordinator::{ConversionReport, Coordinator};
use crate::output::OutputPathResolver;

/// Converts video files, one conversion per call.
pub struct VideoConverter<B: Backend = NativeBackend> {
    backend: Arc<B>,
    config: ConverterConfig,
    resolver: OutputPathResolver,
}

impl<B: Backend> Clone for VideoConverter<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl VideoConverter<NativeBackend> {
    /// A converter over MP4 files and ffmpeg codecs. Output goes to
    /// `config.output_dir`, or the platform movies directory.
    pub fn new(config: ConverterConfig) -> Result<Self> {
        config.validate()?;
        let resolver = match &config.output_dir {
            Some(dir) => OutputPathResolver::new(dir),
            None => OutputPathResolver::platform_default(),
        };
        Ok(Self::with_backend(
            NativeBackend::new(config.clone()),
            config,
            resolver,
        ))
    }
}

impl<B: Backend> VideoConverter<B> {
    /// Converter over a custom backend. `config` is used as given.
    pub fn with_backend(backend: B, config: ConverterConfig, resolver: OutputPathResolver) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
            resolver,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Get the output path resolver.
    pub fn resolver(&self) -> &OutputPathResolver {
        &self.resolver
    }

    /// Convert `source` on the calling thread.
    pub fn run(
        &self,
        source: &MediaLocator,
        output_mime: &str,
        mut on_progress: impl FnMut(f32),
    ) -> Result<ConversionReport> {
        self.run_with_cancel(source, output_mime, &CancelToken::new(), &mut on_progress)
    }

    /// Like [`run`](Self::run), stopping with `Cancelled` once `cancel` is
    /// triggered.
    pub fn run_with_cancel(
        &self,
        source: &MediaLocator,
        output_mime: &str,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<ConversionReport> {
        Coordinator::new(self.backend.as_ref(), &self.config, &self.resolver, cancel).run(
            source,
            output_mime,
            on_progress,
        )
    }

    /// Convert `source` on the calling thread, reporting through callbacks.
    /// Exactly one of `on_complete` and `on_error` is invoked, after every
    /// resource was released.
    pub fn convert<P, C, E>(
        &self,
        source: &MediaLocator,
        output_mime: &str,
        on_progress: P,
        on_complete: C,
        on_error: E,
    ) where
        P: FnMut(f32),
        C: FnOnce(MediaLocator),
        E: FnOnce(ConvertError),
    {
        match self.run(source, output_mime, on_progress) {
            Ok(report) => on_complete(report.output),
            Err(e) => on_error(e),
        }
    }
}

impl<B> VideoConverter<B>
where
    B: Backend + Send + Sync + 'static,
{
    /// Convert `source` on a dedicated thread.
    pub fn spawn(&self, source: MediaLocator, output_mime: impl Into<String>) -> ConversionHandle {
        let (events_tx, events_rx) = unbounded();
        let cancel = CancelToken::new();
        let converter = self.clone();
        let output_mime = output_mime.into();
        let token = cancel.clone();
        let spawn_failure = events_tx.clone();

        let thread = std::thread::Builder::new()
            .name("vconv-convert".into())
            .spawn(move || {
                let events = events_tx;
                let mut on_progress = |fraction: f32| send(&events, ConversionEvent::Progress(fraction));
                let result = converter.run_with_cancel(&source, &output_mime, &token, &mut on_progress);
                match &result {
                    Ok(report) => send(&events, ConversionEvent::Completed(report.output.clone())),
                    Err(e) => send(&events, ConversionEvent::Failed(e.to_string())),
                }
                result
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn conversion thread");
                send(
                    &spawn_failure,
                    ConversionEvent::Failed(format!("failed to spawn conversion thread: {e}")),
                );
                None
            }
        };
        ConversionHandle {
            events: events_rx,
            cancel,
            thread,
        }
    }
}

fn send(events: &Sender<ConversionEvent>, event: ConversionEvent) {
    // A dropped receiver only means nobody listens anymore.
    let _ = events.send(event);
}

/// Notification from a spawned conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionEvent {
    /// Fraction of the source duration written so far.
    Progress(f32),
    Completed(MediaLocator),
    Failed(String),
}

impl ConversionEvent {
    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// A conversion running on its own thread.
pub struct ConversionHandle {
    events: Receiver<ConversionEvent>,
    cancel: CancelToken,
    thread: Option<JoinHandle<Result<ConversionReport>>>,
}

impl ConversionHandle {
    /// Progress events, then exactly one terminal event.
    pub fn events(&self) -> &Receiver<ConversionEvent> {
        &self.events
    }

    /// Ask the conversion to stop. It fails with `Cancelled` at its next
    /// loop iteration.
    pub fn cancel(&self) {
        info!("conversion cancel requested");
        self.cancel.cancel();
    }

    /// A clone of the run's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the conversion thread and return its outcome.
    pub fn join(mut self) -> Result<ConversionReport> {
        let thread = self.thread.take().ok_or_else(|| {
            ConvertError::Io(std::io::Error::other("conversion thread was not started"))
        })?;
        thread
            .join()
            .map_err(|_| ConvertError::Codec("conversion thread panicked".into()))?
    }
}
