#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use scribe_core::store::{DocumentStore, Fields, MemoryStore, StoreError};
use scribe_core::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use scribe_core::validator::{ActionValidator, ValidationRequest, ValidationVerdict, ValidatorError};

/// Replays canned responses in order and counts requests.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    pub requests: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
    }
}

/// Memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_next_put_to: Mutex<Option<String>>,
    fail_all: AtomicBool,
    writes_left: Mutex<Option<usize>>,
}

impl FlakyStore {
    pub fn with_documents(docs: Vec<Fields>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::from_documents(docs),
            ..Self::default()
        })
    }

    /// The next `put` to `title` fails once.
    pub fn fail_next_put_to(&self, title: &str) {
        *self.fail_next_put_to.lock() = Some(title.to_string());
    }

    /// Allow `n` more writes, then fail every write after them.
    pub fn fail_writes_after(&self, n: usize) {
        *self.writes_left.lock() = Some(n);
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    fn check(&self, title: &str) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                title: title.to_string(),
                reason: "store is read-only".into(),
            });
        }
        let mut left = self.writes_left.lock();
        if let Some(remaining) = left.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Rejected {
                    title: title.to_string(),
                    reason: "write budget exhausted".into(),
                });
            }
            *remaining -= 1;
        }
        Ok(())
    }
}

impl DocumentStore for FlakyStore {
    fn exists(&self, title: &str) -> bool {
        self.inner.exists(title)
    }

    fn get(&self, title: &str) -> Option<Fields> {
        self.inner.get(title)
    }

    fn put(&self, title: &str, fields: Fields) -> Result<(), StoreError> {
        self.check(title)?;
        {
            let mut armed = self.fail_next_put_to.lock();
            if armed.as_deref() == Some(title) {
                *armed = None;
                return Err(StoreError::Rejected {
                    title: title.to_string(),
                    reason: "injected failure".into(),
                });
            }
        }
        self.inner.put(title, fields)
    }

    fn delete(&self, title: &str) -> Result<(), StoreError> {
        self.check(title)?;
        self.inner.delete(title)
    }

    fn list(&self) -> Vec<String> {
        self.inner.list()
    }

    fn links_referencing(&self, title: &str) -> Vec<String> {
        self.inner.links_referencing(title)
    }
}

/// Returns a fixed verdict and records what it was asked.
pub struct FixedValidator {
    pub verdict: ValidationVerdict,
    pub calls: Mutex<Vec<ValidationRequest>>,
}

impl FixedValidator {
    pub fn new(verdict: ValidationVerdict) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ActionValidator for FixedValidator {
    async fn validate(
        &self,
        request: &ValidationRequest,
    ) -> Result<ValidationVerdict, ValidatorError> {
        self.calls.lock().push(request.clone());
        Ok(self.verdict.clone())
    }
}

pub fn doc(title: &str, text: &str, tags: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("title".into(), title.into());
    fields.insert("text".into(), text.into());
    if !tags.is_empty() {
        fields.insert("tags".into(), tags.into());
    }
    fields
}
