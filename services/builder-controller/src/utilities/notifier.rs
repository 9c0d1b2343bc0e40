use std::sync::Arc;

use builder_core::{
    crds::{BuildRequest, Image},
    formatters::{BUILD_REQUEST_LABEL, format_managed_selector},
};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        WatchStreamExt,
        reflector::{self, ObjectRef, Store, store::Writer},
        watcher::{self, Event},
    },
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{error::AppError, utilities::work_queue::WorkQueue};

pub type WorkKey = ObjectRef<BuildRequest>;

/// Turns cluster watch events into work items.
///
/// Every BuildRequest event enqueues the request itself, whatever changed.
/// Build Job events are routed to the request named by their label.
pub struct ChangeNotifier {
    client: Client,
    namespace: String,
    queue: Arc<WorkQueue<WorkKey>>,
    build_requests: (Store<BuildRequest>, Writer<BuildRequest>),
    images: (Store<Image>, Writer<Image>),
}

impl ChangeNotifier {
    pub fn new(client: Client, namespace: impl Into<String>, queue: Arc<WorkQueue<WorkKey>>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            queue,
            build_requests: reflector::store(),
            images: reflector::store(),
        }
    }

    pub fn build_request_store(&self) -> Store<BuildRequest> {
        self.build_requests.0.clone()
    }

    pub fn image_store(&self) -> Store<Image> {
        self.images.0.clone()
    }

    /// Resolves to `true` once both caches hold their initial listing.
    pub fn wait_for_cache_sync(&self) -> impl Future<Output = bool> + Send + 'static {
        let build_requests = self.build_request_store();
        let images = self.image_store();

        async move {
            build_requests.wait_until_ready().await.is_ok() && images.wait_until_ready().await.is_ok()
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        let Self {
            client,
            namespace,
            queue,
            build_requests: (_, build_request_writer),
            images: (_, image_writer),
        } = self;

        let build_requests: Api<BuildRequest> = Api::all(client.clone());
        let images: Api<Image> = Api::all(client.clone());
        let jobs: Api<Job> = Api::namespaced(client, &namespace);

        let mut build_request_stream = watcher::watcher(build_requests, watcher::Config::default())
            .default_backoff()
            .reflect(build_request_writer)
            .boxed();
        let mut image_stream = watcher::watcher(images, watcher::Config::default())
            .default_backoff()
            .reflect(image_writer)
            .boxed();
        let mut job_stream = watcher::watcher(
            jobs,
            watcher::Config::default().labels(&format_managed_selector()),
        )
        .default_backoff()
        .boxed();

        info!(namespace = %namespace, "🔍 Starting watchers");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 Watchers stopping");
                        break;
                    }
                }
                Some(event) = build_request_stream.next() => {
                    match event {
                        Ok(event) => {
                            if let Some(request) = touched(event) {
                                queue.add(ObjectRef::from_obj(&request));
                            }
                        }
                        Err(e) => warn!(error = %e, "❌ BuildRequest watch error"),
                    }
                }
                Some(event) = image_stream.next() => {
                    if let Err(e) = event {
                        warn!(error = %e, "❌ Image watch error");
                    }
                }
                Some(event) = job_stream.next() => {
                    match event {
                        Ok(event) => {
                            if let Some(key) = touched(event).and_then(|job| owner_key(&job)) {
                                queue.add(key);
                            }
                        }
                        Err(e) => warn!(error = %e, "❌ Job watch error"),
                    }
                }
            }
        }

        Ok(())
    }
}

/// Object carried by an add, update or delete event.
fn touched<K>(event: Event<K>) -> Option<K> {
    match event {
        Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj) => Some(obj),
        _ => None,
    }
}

/// BuildRequest that owns a build Job, read from the Job's routing label.
fn owner_key(job: &Job) -> Option<WorkKey> {
    let owner = job.labels().get(BUILD_REQUEST_LABEL)?;
    if owner.is_empty() {
        return None;
    }

    debug!(job = %job.name_any(), owner = %owner, "Routing job event");
    Some(ObjectRef::new(owner))
}
