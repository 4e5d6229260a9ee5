//! Handler registry and worker classes
//!
//! Jobs are polymorphic over one capability: run with a context, observing
//! the cancel signal. Dispatch is by `job_type` string through a registry
//! populated at startup; worker classes partition the type space so slow or
//! rate-limited work cannot starve fast work.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use sv_common::models::Job;
use sv_common::params::RuntimeConfig;
use sv_common::{Error, Result};
use tokio::sync::watch;

use crate::queue::job_types;

/// Which partition of the job-type space a worker process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerClass {
    /// General work: ingest, content fetch, markdown, CVE sync, events, build.
    Fetch,
    /// LLM summarization only, so provider spend is isolated and throttled.
    Llm,
}

impl WorkerClass {
    pub fn job_types(self) -> &'static [&'static str] {
        match self {
            WorkerClass::Fetch => &[
                job_types::INGEST_DUE_SOURCES,
                job_types::INGEST_SOURCE,
                job_types::FETCH_ARTICLE_CONTENT,
                job_types::WRITE_ARTICLE_MARKDOWN,
                job_types::CVE_SYNC,
                job_types::EVENTS_REBUILD,
                job_types::EVENTS_PURGE,
                job_types::BUILD_SITE,
            ],
            WorkerClass::Llm => &[job_types::SUMMARIZE_ARTICLE_LLM],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerClass::Fetch => "fetch",
            WorkerClass::Llm => "llm",
        }
    }

    pub fn parse(value: &str) -> Option<WorkerClass> {
        match value {
            "fetch" => Some(WorkerClass::Fetch),
            "llm" => Some(WorkerClass::Llm),
            _ => None,
        }
    }
}

/// Everything a handler needs: the pool, a config snapshot taken when the
/// job was claimed, the claimed row, and the cancel signal.
pub struct JobContext {
    pub pool: SqlitePool,
    pub config: RuntimeConfig,
    pub job: Job,
    pub cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Bail out with `Error::Canceled` when a cancel has been signaled.
    pub fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Race a future against the cancel signal.
    ///
    /// Every suspension point in a handler (network, DB, sleeps, child
    /// processes) should go through this so cancellation is prompt.
    pub async fn cancelable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            result = fut => result,
            _ = cancel.wait_for(|canceled| *canceled) => Err(Error::Canceled),
        }
    }

    /// Payload field accessor for the common `{"key": "value"}` shape.
    pub fn payload_str(&self, key: &str) -> Result<String> {
        self.job
            .payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Validation(format!("{} requires payload field {key}", self.job.job_type))
            })
    }
}

/// The single capability all jobs expose.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<Value>;
}

/// Dispatch table from job type to handler, populated at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: &'static str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

/// Build the full registry for a worker class.
pub fn build_registry(class: WorkerClass) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    match class {
        WorkerClass::Fetch => {
            registry.register(
                job_types::INGEST_DUE_SOURCES,
                Arc::new(crate::ingest::IngestDueSourcesHandler),
            );
            registry.register(
                job_types::INGEST_SOURCE,
                Arc::new(crate::ingest::IngestSourceHandler::new()),
            );
            registry.register(
                job_types::FETCH_ARTICLE_CONTENT,
                Arc::new(crate::content::FetchArticleContentHandler::new()),
            );
            registry.register(
                job_types::WRITE_ARTICLE_MARKDOWN,
                Arc::new(crate::publish::WriteArticleMarkdownHandler),
            );
            registry.register(job_types::CVE_SYNC, Arc::new(crate::cve::CveSyncHandler::new()));
            registry.register(
                job_types::EVENTS_REBUILD,
                Arc::new(crate::events::EventsRebuildHandler),
            );
            registry.register(
                job_types::EVENTS_PURGE,
                Arc::new(crate::events::EventsPurgeHandler),
            );
            registry.register(job_types::BUILD_SITE, Arc::new(crate::publish::BuildSiteHandler));
        }
        WorkerClass::Llm => {
            registry.register(
                job_types::SUMMARIZE_ARTICLE_LLM,
                Arc::new(crate::llm::SummarizeArticleHandler::new()),
            );
        }
    }
    registry
}
