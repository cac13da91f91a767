//! In-memory provider doubles shared by the daemon's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use idgate_core::liveness::{ProviderImage, SessionSettings};
use idgate_core::{ObjectLocation, SessionResults, SessionStatus};

use crate::providers::{CreatedSession, LivenessProvider, ObjectStorage, ProviderError};

/// Liveness provider that replays a script of poll answers. Once the script
/// runs out the last answer repeats.
pub struct FakeLiveness {
    pub session_id: Option<String>,
    script: Mutex<VecDeque<Result<SessionResults, ProviderError>>>,
    last: Mutex<Option<SessionResults>>,
    pub created: Mutex<Vec<SessionSettings>>,
    pub polls: AtomicUsize,
    create_delay: Duration,
}

impl FakeLiveness {
    pub fn new(session_id: Option<&str>) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
        }
    }

    /// Make `create_session` take this long to answer.
    pub fn slow_to_create(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn then(self, answer: SessionResults) -> Self {
        self.script.lock().unwrap().push_back(Ok(answer));
        self
    }

    pub fn then_err(self, err: ProviderError) -> Self {
        self.script.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessProvider for FakeLiveness {
    async fn create_session(&self, settings: &SessionSettings) -> Result<CreatedSession, ProviderError> {
        self.created.lock().unwrap().push(settings.clone());
        tokio::time::sleep(self.create_delay).await;
        Ok(CreatedSession {
            session_id: self.session_id.clone(),
        })
    }

    async fn get_session_results(&self, _session_id: &str) -> Result<SessionResults, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(results)) => {
                *self.last.lock().unwrap() = Some(results.clone());
                Ok(results)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(SessionResults::in_progress)),
        }
    }
}

/// Object store keeping everything in a map.
#[derive(Default)]
pub struct FakeStorage {
    pub objects: Mutex<HashMap<ObjectLocation, (Vec<u8>, String)>>,
    pub fail_put: AtomicBool,
    pub fail_url: AtomicBool,
    /// How long each `put` takes.
    pub put_delay: Mutex<Duration>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ProviderError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(ProviderError::Storage("put refused".into()));
        }
        let delay = *self.put_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.objects
            .lock()
            .unwrap()
            .insert(location.clone(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), ProviderError> {
        self.objects.lock().unwrap().remove(location);
        Ok(())
    }

    async fn retrieval_url(&self, location: &ObjectLocation, ttl: Duration) -> Result<String, ProviderError> {
        if self.fail_url.load(Ordering::SeqCst) {
            return Err(ProviderError::Storage("presign refused".into()));
        }
        Ok(format!("signed://{location}?ttl={}", ttl.as_secs()))
    }

    fn public_url(&self, location: &ObjectLocation) -> String {
        format!("public://{location}")
    }
}

pub fn finished(status: SessionStatus, confidence: f32) -> SessionResults {
    SessionResults {
        status,
        confidence: Some(confidence),
        ..SessionResults::in_progress()
    }
}

pub fn inline_image(bytes: &[u8]) -> ProviderImage {
    ProviderImage {
        location: None,
        bytes: Some(bytes.to_vec()),
    }
}
