//! Jobs client: list pending executions, describe one, update its status,
//! and follow `jobs/notify` change events.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

use iotdev_mqtt::correlator;
use iotdev_mqtt::{Channel, Message, Router, TokenBroker, TokenGenerator};
use iotdev_protocol::jobs::{
    DescribeJobRequest, DescribeJobResponse, JobExecution, JobExecutionState, JobNotification,
    JobsByState, PendingJobsResponse, UpdateJobRequest, UpdateJobResponse,
};
use iotdev_protocol::service::{ClientToken, reply_token};
use iotdev_protocol::{ErrorResponse, IotError, IotResult, ResultExt, topics};

pub type JobChangeCallback = Arc<dyn Fn(&JobsByState) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&IotError) + Send + Sync>;

/// Options for [`JobsClient::update_job`], applied in call order.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    timeout_minutes: Option<u32>,
    details: BTreeMap<String, String>,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `stepTimeoutInMinutes`; a later call overrides an earlier one.
    pub fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    /// Add or overwrite one status detail.
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[derive(Default)]
struct Callbacks {
    on_job_change: Option<JobChangeCallback>,
    on_error: Option<ErrorCallback>,
}

struct Inner {
    prefix: String,
    pending: Arc<TokenBroker<IotResult<PendingJobsResponse>>>,
    describe: Arc<TokenBroker<IotResult<DescribeJobResponse>>>,
    update: Arc<TokenBroker<IotResult<UpdateJobResponse>>>,
    callbacks: Mutex<Callbacks>,
}

impl Inner {
    fn handle(&self, msg: &Message) {
        let Some(rest) = msg
            .topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return;
        };
        let levels: Vec<&str> = rest.split('/').collect();

        match levels.as_slice() {
            ["notify"] => self.notify(&msg.payload),
            ["get", outcome] => self.settle(&self.pending, outcome, &msg.payload),
            [_job_id, "get", outcome] => self.settle(&self.describe, outcome, &msg.payload),
            [_job_id, "update", outcome] => self.settle(&self.update, outcome, &msg.payload),
            _ => tracing::debug!(topic = %msg.topic, "ignoring jobs message"),
        }
    }

    fn notify(&self, payload: &[u8]) {
        match serde_json::from_slice::<JobNotification>(payload) {
            Ok(notification) => {
                let callback = self.lock().on_job_change.clone();
                if let Some(callback) = callback {
                    callback(&notification.jobs);
                }
            }
            Err(e) => self.report(IotError::wrap("decoding job notification", e)),
        }
    }

    fn settle<T>(&self, broker: &TokenBroker<IotResult<T>>, outcome: &str, payload: &[u8])
    where
        T: DeserializeOwned + ClientToken + Send + 'static,
    {
        let reply = match outcome {
            topics::ACCEPTED => serde_json::from_slice::<T>(payload).map_err(IotError::from),
            topics::REJECTED => match serde_json::from_slice::<ErrorResponse>(payload) {
                Ok(rejection) => Err(IotError::Rejected(rejection)),
                Err(e) => Err(IotError::from(e)),
            },
            other => {
                tracing::debug!(outcome = other, "ignoring jobs response");
                return;
            }
        };

        let token = reply_token(&reply, payload);
        if let Err(Err(e)) = broker.deliver_token(token.as_deref(), reply) {
            self.report(IotError::wrap("handling jobs response", e));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, err: IotError) {
        let callback = self.lock().on_error.clone();
        match callback {
            Some(callback) => callback(&err),
            None => tracing::warn!(error = %err, "jobs error"),
        }
    }
}

/// Client for the Jobs service of one thing.
pub struct JobsClient {
    channel: Arc<dyn Channel>,
    thing_name: String,
    tokens: TokenGenerator,
    inner: Arc<Inner>,
}

impl JobsClient {
    /// Register routes for `notify`, `get/#`, `+/get/#` and `+/update/#`
    /// and subscribe to them.
    pub async fn start(channel: Arc<dyn Channel>, router: &Router) -> IotResult<Self> {
        let thing_name = channel.thing_name().to_string();
        let inner = Arc::new(Inner {
            prefix: topics::jobs_prefix(&thing_name),
            pending: TokenBroker::new(),
            describe: TokenBroker::new(),
            update: TokenBroker::new(),
            callbacks: Mutex::new(Callbacks::default()),
        });

        let filters = [
            topics::jobs_notify(&thing_name),
            topics::jobs_get_responses(&thing_name),
            topics::job_get_responses(&thing_name),
            topics::job_update_responses(&thing_name),
        ];
        let handler = inner.clone();
        channel
            .subscribe_routed(router, &filters, Arc::new(move |m| handler.handle(m)))
            .await
            .wrap_err("subscribing to jobs topics")?;

        tracing::info!(thing = %thing_name, "jobs client started");
        Ok(Self {
            channel,
            thing_name,
            tokens: TokenGenerator::new(),
            inner,
        })
    }

    /// In-progress and queued executions for this thing.
    pub async fn get_pending_jobs(&self) -> IotResult<JobsByState> {
        let token = self.tokens.next_token();
        let body = DescribeJobRequest {
            client_token: token.clone(),
            ..DescribeJobRequest::default()
        };
        let topic = topics::jobs_get(&self.thing_name);
        let response = self
            .request(&self.inner.pending, &token, &topic, &body)
            .await
            .wrap_err("listing pending jobs")?;
        Ok(response.into_map())
    }

    /// Full execution of `job_id`, including the job document.
    pub async fn describe_job(&self, job_id: &str) -> IotResult<JobExecution> {
        let token = self.tokens.next_token();
        let body = DescribeJobRequest {
            include_job_document: true,
            execution_number: None,
            client_token: token.clone(),
        };
        let topic = topics::job_get(&self.thing_name, job_id);
        let response = self
            .request(&self.inner.describe, &token, &topic, &body)
            .await
            .wrap_err("describing job")?;
        Ok(response.execution)
    }

    /// Move `execution` to `status`.
    ///
    /// The request carries `expectedVersion` from the execution, so the
    /// service rejects the update if the execution changed meanwhile.
    pub async fn update_job(
        &self,
        execution: &JobExecution,
        status: JobExecutionState,
        options: UpdateOptions,
    ) -> IotResult<()> {
        let token = self.tokens.next_token();
        let mut status_details = execution.status_details.clone();
        status_details.extend(options.details);
        let body = UpdateJobRequest {
            status,
            expected_version: execution.version_number,
            status_details,
            step_timeout_in_minutes: options.timeout_minutes,
            client_token: token.clone(),
        };
        let topic = topics::job_update(&self.thing_name, &execution.job_id);
        self.request(&self.inner.update, &token, &topic, &body)
            .await
            .wrap_err("updating job")?;
        tracing::info!(job_id = %execution.job_id, ?status, "job execution updated");
        Ok(())
    }

    pub fn on_job_change<F>(&self, callback: F)
    where
        F: Fn(&JobsByState) + Send + Sync + 'static,
    {
        self.inner.lock().on_job_change = Some(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&IotError) + Send + Sync + 'static,
    {
        self.inner.lock().on_error = Some(Arc::new(callback));
    }

    async fn request<T, B>(
        &self,
        broker: &Arc<TokenBroker<IotResult<T>>>,
        token: &str,
        topic: &str,
        body: &B,
    ) -> IotResult<T>
    where
        T: Send + 'static,
        B: serde::Serialize,
    {
        let payload = serde_json::to_vec(body)?;
        correlator::request(broker, token, self.channel.as_ref(), topic, &payload).await?
    }
}
