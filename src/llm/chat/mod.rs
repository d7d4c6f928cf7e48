pub mod openai;

use async_trait::async_trait;
use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;
use tokio::sync::watch;

use self::openai::OpenAIChatClient;
use crate::error::ChatError;
use crate::models::completion::RequestEnvelope;

pub type ProgressCallback = Box<dyn Fn(f32) + Send + Sync>;

/// One HTTP exchange with the completions endpoint.
///
/// Implementations return the raw response body and never retry. Only one
/// execution per session is ever in flight; the session enforces that, not
/// the transport. Dropping the returned future aborts the exchange.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn execute(
        &self,
        envelope: &RequestEnvelope,
        credential: &str,
        timeout: Duration,
        progress: &ProgressReporter
    ) -> Result<String, ChatError>;

    fn endpoint(&self) -> &str;
}

pub fn new_client(base_url: Option<String>) -> Result<Arc<dyn ChatTransport>, ChatError> {
    let client = OpenAIChatClient::new(base_url)?;
    Ok(Arc::new(client))
}

#[derive(Default)]
struct Fractions {
    upload: f32,
    download: f32,
}

impl Fractions {
    fn mean(&self) -> f32 {
        (self.upload + self.download) / 2.0
    }
}

struct ProgressInner {
    fractions: Mutex<Fractions>,
    sink: Option<Arc<watch::Sender<f32>>>,
    callback: Option<ProgressCallback>,
}

/// Tracks upload and download fractions of one exchange and publishes
/// their mean. Each fraction only grows, so the published value never
/// decreases.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ProgressInner>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<watch::Sender<f32>>, callback: Option<ProgressCallback>) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                fractions: Mutex::new(Fractions::default()),
                sink: Some(sink),
                callback,
            }),
        }
    }

    /// A reporter nobody observes.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                fractions: Mutex::new(Fractions::default()),
                sink: None,
                callback: None,
            }),
        }
    }

    pub fn upload(&self, fraction: f32) {
        self.update(|f| {
            f.upload = f.upload.max(normalize(fraction));
        });
    }

    pub fn download(&self, fraction: f32) {
        self.update(|f| {
            f.download = f.download.max(normalize(fraction));
        });
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> f32 {
        self.lock().mean()
    }

    fn lock(&self) -> MutexGuard<'_, Fractions> {
        self.inner.fractions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Publishing under the lock keeps concurrent upload/download samples
    // from reaching observers out of order.
    fn update(&self, apply: impl FnOnce(&mut Fractions)) {
        let mut fractions = self.lock();
        let before = fractions.mean();
        apply(&mut fractions);
        let after = fractions.mean();
        if after <= before && before > 0.0 {
            return;
        }
        if let Some(sink) = &self.inner.sink {
            sink.send_replace(after);
        }
        if let Some(callback) = &self.inner.callback {
            callback(after);
        }
    }
}

fn normalize(fraction: f32) -> f32 {
    if fraction.is_nan() {
        return 0.0;
    }
    fraction.clamp(0.0, 1.0)
}
