//! Drives an order from creation to a terminal state by polling `collect`.
//!
//! ```rust,ignore
//! let transport = HttpTransport::new(&config)?;
//! let client = Arc::new(BankIdClient::new(transport, config.mobile_policy.clone()));
//! let hooks = FlowHooks::new()
//!     .with_launcher(|info: &LaunchInfo| open_app(&info.url))
//!     .with_store(Arc::new(AuditLog::default()));
//!
//! let flow = Flow::new(client, PollConfig::default(), hooks)?;
//! match flow.auth_flow("190000000000", "203.0.113.7", false).await? {
//!     FlowResult::Complete(data) => println!("signed in {}", data.user.name),
//!     FlowResult::Failed { hint_code } => println!("failed: {hint_code}"),
//! }
//! ```
use std::{
    future::pending,
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    client::BankIdClient,
    config::PollConfig,
    error::BankIdError,
    launch::LaunchInfo,
    transport::Transport,
    types::{CollectResponse, CollectStatus, CompletionData, Method},
};

/// Terminal outcome of a flow. Both variants are expected end states of an
/// order, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowResult {
    /// The order completed. Carries everything that must be stored for audit.
    Complete(Box<CompletionData>),
    /// The order failed. `hint_code` tells why, e.g. `userCancel` or `expiredTransaction`.
    Failed {
        /// The `hintCode` of the failed `collect` response
        hint_code: String,
    },
}

impl FlowResult {
    /// `true` when the order completed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Starts the BankID app once an order has been created.
pub trait Launcher: Send + Sync {
    /// Called exactly once per flow, right after the order was created.
    fn launch(&self, info: &LaunchInfo);
}

impl<F> Launcher for F
where
    F: Fn(&LaunchInfo) + Send + Sync,
{
    fn launch(&self, info: &LaunchInfo) {
        self(info);
    }
}

/// Stores the result of a completed order.
///
/// The RP must keep `signature`, `user` and `ocspResponse` of every completed
/// order.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Called once when an order completes.
    ///
    /// # Errors
    /// A failure is logged and does not change the result of the flow.
    async fn persist(&self, data: &CompletionData) -> Result<(), BankIdError>;
}

/// Optional side effects of a flow.
#[derive(Clone, Default)]
pub struct FlowHooks {
    launcher: Option<Arc<dyn Launcher>>,
    store: Option<Arc<dyn ResultStore>>,
}

impl FlowHooks {
    /// Hooks that do nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hook invoked when the order is created.
    #[must_use]
    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// Sets the hook invoked when the order completes.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl std::fmt::Debug for FlowHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHooks")
            .field("launcher", &self.launcher.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// The order a flow creates.
#[derive(Debug, Clone)]
enum Order {
    Auth {
        personal_number: String,
        end_user_ip: String,
        other_device: bool,
    },
    Sign {
        personal_number: String,
        end_user_ip: String,
        text: String,
        other_device: bool,
    },
}

impl Order {
    const fn method(&self) -> Method {
        match self {
            Self::Auth { .. } => Method::Auth,
            Self::Sign { .. } => Method::Sign,
        }
    }
}

/// Runs auth and sign flows against one client.
pub struct Flow<T> {
    client: Arc<BankIdClient<T>>,
    poll: PollConfig,
    hooks: FlowHooks,
    persisting: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            poll: self.poll.clone(),
            hooks: self.hooks.clone(),
            persisting: Arc::clone(&self.persisting),
        }
    }
}

impl<T: Transport + 'static> Flow<T> {
    /// Creates a flow runner.
    ///
    /// # Errors
    /// Returns [`BankIdError::InvalidInput`] if `poll` is invalid.
    pub fn new(
        client: Arc<BankIdClient<T>>,
        poll: PollConfig,
        hooks: FlowHooks,
    ) -> Result<Self, BankIdError> {
        poll.validate()?;
        Ok(Self {
            client,
            poll,
            hooks,
            persisting: Arc::default(),
        })
    }

    /// Waits until every persistence hook started so far has finished.
    ///
    /// Flows return as soon as the order completes and persist in the
    /// background. A process that is about to exit calls this so no completed
    /// order goes unrecorded.
    pub async fn persisted(&self) {
        let tasks = mem::take(
            &mut *self
                .persisting
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "persistence task did not finish");
            }
        }
    }

    /// Authenticates `personal_number` and waits for the order to finish.
    ///
    /// # Errors
    /// Returns the error of the `auth` call, [`BankIdError::RequestFailed`] if no
    /// order was created, and the polling errors described on [`BankIdError`].
    pub async fn auth_flow(
        &self,
        personal_number: &str,
        end_user_ip: &str,
        other_device: bool,
    ) -> Result<FlowResult, BankIdError> {
        let order = Order::Auth {
            personal_number: personal_number.to_string(),
            end_user_ip: end_user_ip.to_string(),
            other_device,
        };
        self.run(order, None).await
    }

    /// Lets `personal_number` sign `text` and waits for the order to finish.
    ///
    /// # Errors
    /// Same as [`Self::auth_flow`].
    pub async fn sign_flow(
        &self,
        personal_number: &str,
        end_user_ip: &str,
        text: &str,
        other_device: bool,
    ) -> Result<FlowResult, BankIdError> {
        let order = Order::Sign {
            personal_number: personal_number.to_string(),
            end_user_ip: end_user_ip.to_string(),
            text: text.to_string(),
            other_device,
        };
        self.run(order, None).await
    }

    /// Runs [`Self::auth_flow`] on a task that can be aborted through the returned handle.
    #[must_use]
    pub fn spawn_auth_flow(
        &self,
        personal_number: &str,
        end_user_ip: &str,
        other_device: bool,
    ) -> FlowHandle {
        self.spawn(Order::Auth {
            personal_number: personal_number.to_string(),
            end_user_ip: end_user_ip.to_string(),
            other_device,
        })
    }

    /// Runs [`Self::sign_flow`] on a task that can be aborted through the returned handle.
    #[must_use]
    pub fn spawn_sign_flow(
        &self,
        personal_number: &str,
        end_user_ip: &str,
        text: &str,
        other_device: bool,
    ) -> FlowHandle {
        self.spawn(Order::Sign {
            personal_number: personal_number.to_string(),
            end_user_ip: end_user_ip.to_string(),
            text: text.to_string(),
            other_device,
        })
    }

    fn spawn(&self, order: Order) -> FlowHandle {
        let flow = self.clone();
        let (abort, aborted) = watch::channel(false);
        let task = tokio::spawn(async move { flow.run(order, Some(aborted)).await });
        FlowHandle { abort, task }
    }

    async fn run(
        &self,
        order: Order,
        mut abort: Option<watch::Receiver<bool>>,
    ) -> Result<FlowResult, BankIdError> {
        let method = order.method();
        let response = match &order {
            Order::Auth {
                personal_number,
                end_user_ip,
                other_device,
            } => {
                self.client
                    .auth(personal_number, end_user_ip, *other_device)
                    .await?
            }
            Order::Sign {
                personal_number,
                end_user_ip,
                text,
                other_device,
            } => {
                self.client
                    .sign(personal_number, text, end_user_ip, *other_device)
                    .await?
            }
        };

        let (Some(auto_start_token), Some(order_ref)) =
            (response.auto_start_token, response.order_ref)
        else {
            return Err(BankIdError::RequestFailed { method });
        };
        info!(%method, %order_ref, "order created");

        if let Some(launcher) = &self.hooks.launcher {
            launcher.launch(&LaunchInfo::new(&auto_start_token, &order_ref));
        }

        let deadline = self.poll.timeout.map(|timeout| Instant::now() + timeout);
        let result = loop {
            tokio::select! {
                () = sleep(self.poll.interval) => {}
                () = aborted(&mut abort) => return Err(self.abort(order_ref).await),
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(%order_ref, "order did not finish before the polling timeout");
                self.cancel_remote(&order_ref).await;
                return Err(BankIdError::Timeout { order_ref });
            }

            let response = tokio::select! {
                response = self.collect(&order_ref) => response?,
                () = aborted(&mut abort) => return Err(self.abort(order_ref).await),
            };

            match response.status {
                CollectStatus::Failed => {
                    break FlowResult::Failed {
                        hint_code: response.hint_code.unwrap_or_else(|| "unknown".to_string()),
                    };
                }
                CollectStatus::Complete => {
                    let data = response.completion_data.ok_or_else(|| {
                        BankIdError::SerializationError {
                            error: format!("order {order_ref} is complete but has no completionData"),
                        }
                    })?;
                    break FlowResult::Complete(Box::new(data));
                }
                CollectStatus::Pending | CollectStatus::Unknown => {
                    debug!(%order_ref, hint_code = ?response.hint_code, "order pending");
                }
            }
        };

        match &result {
            FlowResult::Complete(data) => {
                info!(%order_ref, "order complete");
                self.persist(order_ref, data);
            }
            FlowResult::Failed { hint_code } => {
                info!(%order_ref, %hint_code, "order failed");
            }
        }

        Ok(result)
    }

    /// Hands the completion data to the store on its own task. The flow result
    /// does not wait for it and is not affected by how it ends.
    fn persist(&self, order_ref: String, data: &CompletionData) {
        let Some(store) = self.hooks.store.clone() else {
            return;
        };
        let data = data.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = store.persist(&data).await {
                warn!(%order_ref, error = %err, "failed to persist completion data");
            }
        });

        let mut persisting = self
            .persisting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        persisting.retain(|task| !task.is_finished());
        persisting.push(task);
    }

    /// One poll. Transient failures are retried with backoff up to
    /// `max_retries` times before the flow gives up.
    async fn collect(&self, order_ref: &str) -> Result<CollectResponse, BankIdError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.poll.max_retries as usize);

        (|| self.client.collect(order_ref))
            .retry(backoff)
            .when(BankIdError::is_transient)
            .notify(|err: &BankIdError, delay: Duration| {
                warn!(%order_ref, error = %err, ?delay, "collect failed, retrying");
            })
            .await
            .map_err(|err| {
                if err.is_transient() {
                    BankIdError::PollingFailed {
                        order_ref: order_ref.to_string(),
                        error: Box::new(err),
                    }
                } else {
                    err
                }
            })
    }

    async fn abort(&self, order_ref: String) -> BankIdError {
        info!(%order_ref, "flow aborted");
        self.cancel_remote(&order_ref).await;
        BankIdError::Cancelled { order_ref }
    }

    async fn cancel_remote(&self, order_ref: &str) {
        if !self.poll.cancel_on_abort {
            return;
        }
        if let Err(err) = self.client.cancel(order_ref).await {
            warn!(%order_ref, error = %err, "failed to cancel order");
        }
    }
}

/// Resolves once the flow has been aborted. Never resolves without a handle or
/// after the handle was dropped without aborting.
async fn aborted(abort: &mut Option<watch::Receiver<bool>>) {
    if let Some(receiver) = abort {
        let closed = receiver.wait_for(|aborted| *aborted).await.is_err();
        if !closed {
            return;
        }
    }
    pending::<()>().await;
}

/// Handle to a flow running on its own task.
#[derive(Debug)]
pub struct FlowHandle {
    abort: watch::Sender<bool>,
    task: JoinHandle<Result<FlowResult, BankIdError>>,
}

impl FlowHandle {
    /// Stops polling at the next suspension point. The order is cancelled
    /// remotely when `cancel_on_abort` is set and the flow ends with
    /// [`BankIdError::Cancelled`]. Does nothing once the flow has finished.
    pub fn cancel(&self) {
        self.abort.send_replace(true);
    }

    /// Whether the flow has reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the terminal outcome of the flow.
    ///
    /// The returned future may be dropped and `join` called again, e.g. after
    /// [`Self::cancel`], but not once it has resolved.
    ///
    /// # Errors
    /// Returns the error the flow ended with, or [`BankIdError::Join`] if the
    /// task panicked.
    pub async fn join(&mut self) -> Result<FlowResult, BankIdError> {
        (&mut self.task).await.map_err(|err| BankIdError::Join {
            error: err.to_string(),
        })?
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    use serde_json::{json, Value};

    use super::*;
    use crate::error::ErrorCode;

    type Script = VecDeque<Result<Value, BankIdError>>;

    /// Answers `auth`/`sign` per personal number and `collect` from a per-order script.
    /// A drained script keeps answering `pending`.
    #[derive(Default)]
    struct ScriptedTransport {
        orders: HashMap<String, Value>,
        collects: Mutex<HashMap<String, Script>>,
        calls: Mutex<Vec<(Method, Value)>>,
    }

    impl ScriptedTransport {
        fn order(mut self, personal_number: &str, order_ref: &str) -> Self {
            self.orders.insert(
                personal_number.to_string(),
                json!({ "autoStartToken": format!("token-{order_ref}"), "orderRef": order_ref }),
            );
            self
        }

        fn order_response(mut self, personal_number: &str, response: Value) -> Self {
            self.orders.insert(personal_number.to_string(), response);
            self
        }

        fn collects(self, order_ref: &str, script: Vec<Result<Value, BankIdError>>) -> Self {
            self.collects
                .lock()
                .unwrap()
                .insert(order_ref.to_string(), script.into());
            self
        }

        fn calls(&self, method: Method) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| *m == method)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(&self, method: Method, params: Value) -> Result<Value, BankIdError> {
            self.calls.lock().unwrap().push((method, params.clone()));
            match method {
                Method::Auth | Method::Sign => {
                    let personal_number = params["personalNumber"].as_str().unwrap();
                    Ok(self.orders.get(personal_number).cloned().unwrap_or(json!({})))
                }
                Method::Collect => {
                    let order_ref = params["orderRef"].as_str().unwrap().to_string();
                    self.collects
                        .lock()
                        .unwrap()
                        .get_mut(&order_ref)
                        .and_then(VecDeque::pop_front)
                        .unwrap_or_else(|| Ok(pending(&order_ref)))
                }
                Method::Cancel => Ok(json!({})),
            }
        }
    }

    fn pending(order_ref: &str) -> Value {
        json!({ "orderRef": order_ref, "status": "pending", "hintCode": "outstandingTransaction" })
    }

    fn failed(order_ref: &str, hint_code: &str) -> Value {
        json!({ "orderRef": order_ref, "status": "failed", "hintCode": hint_code })
    }

    fn complete(order_ref: &str, personal_number: &str) -> Value {
        json!({
            "orderRef": order_ref,
            "status": "complete",
            "completionData": {
                "user": {
                    "personalNumber": personal_number,
                    "name": "Karl Karlsson",
                    "givenName": "Karl",
                    "surname": "Karlsson"
                },
                "device": { "ipAddress": "192.168.0.1" },
                "cert": { "notBefore": "1502983274000", "notAfter": "1563549674000" },
                "signature": format!("signature-{order_ref}"),
                "ocspResponse": format!("ocsp-{order_ref}")
            }
        })
    }

    fn transient() -> BankIdError {
        BankIdError::NetworkError {
            url: "https://appapi2.test.bankid.com/rp/v5/collect".to_string(),
            status: None,
            error: "connection reset".to_string(),
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        persisted: Mutex<Vec<CompletionData>>,
        fail: bool,
    }

    #[async_trait]
    impl ResultStore for MemoryStore {
        async fn persist(&self, data: &CompletionData) -> Result<(), BankIdError> {
            self.persisted.lock().unwrap().push(data.clone());
            if self.fail {
                return Err(BankIdError::SerializationError {
                    error: "disk full".to_string(),
                });
            }
            Ok(())
        }
    }

    fn flow(
        transport: ScriptedTransport,
        poll: PollConfig,
        hooks: FlowHooks,
    ) -> (Flow<ScriptedTransport>, Arc<BankIdClient<ScriptedTransport>>) {
        let client = Arc::new(BankIdClient::new(transport, "1.2.3.4.25"));
        let flow = Flow::new(Arc::clone(&client), poll, hooks).unwrap();
        (flow, client)
    }

    fn transport(client: &BankIdClient<ScriptedTransport>) -> &ScriptedTransport {
        client.transport()
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_three_polls() {
        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects(
                "order-1",
                vec![
                    Ok(pending("order-1")),
                    Ok(pending("order-1")),
                    Ok(complete("order-1", "190000000000")),
                ],
            );
        let launched = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(MemoryStore::default());
        let hooks = {
            let launched = Arc::clone(&launched);
            FlowHooks::new()
                .with_launcher(move |info: &LaunchInfo| {
                    launched.lock().unwrap().push(info.clone());
                })
                .with_store(store.clone())
        };
        let (flow, client) = flow(scripted, PollConfig::default(), hooks);

        let started = Instant::now();
        let result = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap();

        assert!(result.is_ok());
        let FlowResult::Complete(data) = result else {
            panic!("expected a completed order");
        };
        assert_eq!(data.signature, "signature-order-1");
        assert_eq!(transport(&client).calls(Method::Collect).len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(started.elapsed() < Duration::from_secs(7));

        let launched = launched.lock().unwrap();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].order_ref, "order-1");
        assert_eq!(
            launched[0].url,
            "bankid:///?autostarttoken=token-order-1&redirect=null"
        );
        drop(launched);

        flow.persisted().await;
        let persisted = store.persisted.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0], *data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_order_stops_polling() {
        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects(
                "order-1",
                vec![Ok(pending("order-1")), Ok(failed("order-1", "userCancel"))],
            );
        let store = Arc::new(MemoryStore::default());
        let (flow, client) = flow(
            scripted,
            PollConfig::default(),
            FlowHooks::new().with_store(store.clone()),
        );

        let result = flow
            .sign_flow("190000000000", "127.0.0.1", "Test text for signing", false)
            .await
            .unwrap();

        assert!(!result.is_ok());
        assert_eq!(
            result,
            FlowResult::Failed {
                hint_code: "userCancel".to_string()
            }
        );

        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport(&client).calls(Method::Collect).len(), 2);
        assert!(transport(&client).calls(Method::Cancel).is_empty());
        assert!(store.persisted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_order_fails_without_polling() {
        let scripted = ScriptedTransport::default()
            .order_response("190000000000", json!({ "orderRef": "order-1" }));
        let launched = Arc::new(Mutex::new(0));
        let hooks = {
            let launched = Arc::clone(&launched);
            FlowHooks::new().with_launcher(move |_: &LaunchInfo| {
                *launched.lock().unwrap() += 1;
            })
        };
        let (flow, client) = flow(scripted, PollConfig::default(), hooks);

        let err = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BankIdError::RequestFailed {
                method: Method::Auth
            }
        ));
        assert!(transport(&client).calls(Method::Collect).is_empty());
        assert_eq!(*launched.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_without_order_ref_fails_without_polling() {
        let scripted = ScriptedTransport::default().order_response(
            "190000000000",
            json!({ "autoStartToken": "7c40b5c9-fa74-49cf-b98c-bfe651f9a7c6" }),
        );
        let (flow, client) = flow(scripted, PollConfig::default(), FlowHooks::new());

        let err = flow
            .sign_flow("190000000000", "127.0.0.1", "Test text for signing", false)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BankIdError::RequestFailed {
                method: Method::Sign
            }
        ));
        assert!(transport(&client).calls(Method::Collect).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_create_response_fails_without_polling() {
        let scripted =
            ScriptedTransport::default().order_response("190000000000", Value::Null);
        let (flow, client) = flow(scripted, PollConfig::default(), FlowHooks::new());

        let err = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BankIdError::RequestFailed {
                method: Method::Auth
            }
        ));
        assert!(transport(&client).calls(Method::Collect).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_error_is_returned_unchanged() {
        struct Conflict;

        #[async_trait]
        impl Transport for Conflict {
            async fn call(&self, _: Method, _: Value) -> Result<Value, BankIdError> {
                Err(BankIdError::AlreadyInProgress {
                    details: "Order already in progress for pno".to_string(),
                })
            }
        }

        let client = Arc::new(BankIdClient::new(Conflict, "1.2.3.4.25"));
        let flow = Flow::new(client, PollConfig::default(), FlowHooks::new()).unwrap();
        let err = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, BankIdError::AlreadyInProgress { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_collect_failures_are_retried() {
        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects(
                "order-1",
                vec![
                    Err(transient()),
                    Err(transient()),
                    Ok(complete("order-1", "190000000000")),
                ],
            );
        let (flow, client) = flow(scripted, PollConfig::default(), FlowHooks::new());

        let result = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(transport(&client).calls(Method::Collect).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_failures_exhaust_retries() {
        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects(
                "order-1",
                vec![
                    Ok(pending("order-1")),
                    Err(transient()),
                    Err(transient()),
                    Err(transient()),
                ],
            );
        let poll = PollConfig {
            max_retries: 2,
            ..PollConfig::default()
        };
        let (flow, client) = flow(scripted, poll, FlowHooks::new());

        let err = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap_err();

        match err {
            BankIdError::PollingFailed { order_ref, error } => {
                assert_eq!(order_ref, "order-1");
                assert!(error.is_transient());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(transport(&client).calls(Method::Collect).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_collect_failure_ends_flow() {
        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects(
                "order-1",
                vec![Err(BankIdError::Api {
                    status: 400,
                    code: ErrorCode::InvalidParameters,
                    details: "No such order".to_string(),
                })],
            );
        let (flow, client) = flow(scripted, PollConfig::default(), FlowHooks::new());

        let err = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BankIdError::Api {
                code: ErrorCode::InvalidParameters,
                ..
            }
        ));
        assert_eq!(transport(&client).calls(Method::Collect).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_order() {
        let scripted = ScriptedTransport::default().order("190000000000", "order-1");
        let poll = PollConfig {
            timeout: Some(Duration::from_secs(5)),
            ..PollConfig::default()
        };
        let (flow, client) = flow(scripted, poll, FlowHooks::new());

        let err = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap_err();

        assert!(matches!(err, BankIdError::Timeout { ref order_ref } if order_ref == "order-1"));
        assert_eq!(transport(&client).calls(Method::Collect).len(), 2);
        assert_eq!(
            transport(&client).calls(Method::Cancel),
            vec![json!({ "orderRef": "order-1" })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_order() {
        let scripted = ScriptedTransport::default().order("190000000000", "order-1");
        let (flow, client) = flow(scripted, PollConfig::default(), FlowHooks::new());

        let mut handle = flow.spawn_auth_flow("190000000000", "127.0.0.1", true);
        sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());
        handle.cancel();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, BankIdError::Cancelled { ref order_ref } if order_ref == "order-1"));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport(&client).calls(Method::Collect).len(), 1);
        assert_eq!(transport(&client).calls(Method::Cancel).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_without_remote_cancel() {
        let scripted = ScriptedTransport::default().order("190000000000", "order-1");
        let poll = PollConfig {
            cancel_on_abort: false,
            ..PollConfig::default()
        };
        let (flow, client) = flow(scripted, poll, FlowHooks::new());

        let mut handle = flow.spawn_auth_flow("190000000000", "127.0.0.1", false);
        handle.cancel();

        assert!(matches!(
            handle.join().await,
            Err(BankIdError::Cancelled { .. })
        ));
        assert!(transport(&client).calls(Method::Cancel).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failure_does_not_change_result() {
        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects("order-1", vec![Ok(complete("order-1", "190000000000"))]);
        let store = Arc::new(MemoryStore {
            fail: true,
            ..MemoryStore::default()
        });
        let (flow, _client) = flow(
            scripted,
            PollConfig::default(),
            FlowHooks::new().with_store(store.clone()),
        );

        let result = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap();

        assert!(result.is_ok());
        flow.persisted().await;
        assert_eq!(store.persisted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_does_not_wait_for_store() {
        struct HangingStore;

        #[async_trait]
        impl ResultStore for HangingStore {
            async fn persist(&self, _: &CompletionData) -> Result<(), BankIdError> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects("order-1", vec![Ok(complete("order-1", "190000000000"))]);
        let (flow, _client) = flow(
            scripted,
            PollConfig::default(),
            FlowHooks::new().with_store(Arc::new(HangingStore)),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            flow.auth_flow("190000000000", "127.0.0.1", false),
        )
        .await
        .expect("flow should resolve while the store hangs")
        .unwrap();

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_store_does_not_fail_flow() {
        struct PanickingStore;

        #[async_trait]
        impl ResultStore for PanickingStore {
            async fn persist(&self, _: &CompletionData) -> Result<(), BankIdError> {
                panic!("store exploded");
            }
        }

        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects("order-1", vec![Ok(complete("order-1", "190000000000"))]);
        let (flow, _client) = flow(
            scripted,
            PollConfig::default(),
            FlowHooks::new().with_store(Arc::new(PanickingStore)),
        );

        let mut handle = flow.spawn_auth_flow("190000000000", "127.0.0.1", false);
        assert!(handle.join().await.unwrap().is_ok());
        flow.persisted().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_without_completion_data() {
        let scripted = ScriptedTransport::default()
            .order("190000000000", "order-1")
            .collects(
                "order-1",
                vec![Ok(json!({ "orderRef": "order-1", "status": "complete" }))],
            );
        let (flow, _client) = flow(scripted, PollConfig::default(), FlowHooks::new());

        let err = flow
            .auth_flow("190000000000", "127.0.0.1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, BankIdError::SerializationError { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flows_poll_their_own_orders() {
        let scripted = ScriptedTransport::default()
            .order("190000000001", "order-a")
            .order("190000000002", "order-b")
            .collects(
                "order-a",
                vec![
                    Ok(pending("order-a")),
                    Ok(complete("order-a", "190000000001")),
                ],
            )
            .collects(
                "order-b",
                vec![
                    Ok(pending("order-b")),
                    Ok(pending("order-b")),
                    Ok(pending("order-b")),
                    Ok(failed("order-b", "expiredTransaction")),
                ],
            );
        let (flow, client) = flow(scripted, PollConfig::default(), FlowHooks::new());

        let mut a = flow.spawn_auth_flow("190000000001", "127.0.0.1", false);
        let mut b = flow.spawn_sign_flow("190000000002", "127.0.0.1", "Pay 100 SEK", false);

        let FlowResult::Complete(data) = a.join().await.unwrap() else {
            panic!("expected order-a to complete");
        };
        assert_eq!(data.user.personal_number, "190000000001");
        assert_eq!(
            b.join().await.unwrap(),
            FlowResult::Failed {
                hint_code: "expiredTransaction".to_string()
            }
        );

        let collects = transport(&client).calls(Method::Collect);
        let polled = |order_ref: &str| {
            collects
                .iter()
                .filter(|params| params["orderRef"] == order_ref)
                .count()
        };
        assert_eq!(polled("order-a"), 2);
        assert_eq!(polled("order-b"), 4);
        assert_eq!(collects.len(), 6);
    }

    #[test]
    fn test_invalid_poll_config() {
        let client = Arc::new(BankIdClient::new(
            ScriptedTransport::default(),
            "1.2.3.4.25",
        ));
        let poll = PollConfig {
            interval: Duration::ZERO,
            ..PollConfig::default()
        };
        assert!(matches!(
            Flow::new(client, poll, FlowHooks::new()),
            Err(BankIdError::InvalidInput { .. })
        ));
    }
}
