use std::pin::pin;

use futures::StreamExt;
use futures::stream;
use tracing::{info, warn};

use super::{PendingCharge, Session};
use crate::error::Error;
use crate::providers::types::{ChatParams, ChatResponse};

/// How a batch is admitted and run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    /// Requests in flight at once. `None` falls back to the session's
    /// default, and unbounded if that is unset too.
    pub max_concurrent: Option<usize>,
    /// Admit each item on its own when it is dispatched. When `false`, every
    /// item's estimate is reserved up front as one all-or-nothing group.
    pub check_budget_per_item: bool,
    /// Stop at the first failed item (in input order) and return its error.
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            check_budget_per_item: true,
            fail_fast: false,
        }
    }
}

impl BatchOptions {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn all_or_nothing(mut self) -> Self {
        self.check_budget_per_item = false;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

/// One request produced from a batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub prompt: String,
    pub params: ChatParams,
}

impl BatchRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: ChatParams::default(),
        }
    }

    pub fn with_params(mut self, params: ChatParams) -> Self {
        self.params = params;
        self
    }
}

impl From<String> for BatchRequest {
    fn from(prompt: String) -> Self {
        Self::new(prompt)
    }
}

impl From<&str> for BatchRequest {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

impl From<(String, ChatParams)> for BatchRequest {
    fn from((prompt, params): (String, ChatParams)) -> Self {
        Self { prompt, params }
    }
}

/// Outcome of one batch item.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Position in the input.
    pub index: usize,
    pub request_id: String,
    pub prompt: String,
    pub result: Result<ChatResponse, Error>,
}

/// Per-item outcomes in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn responses(&self) -> impl Iterator<Item = &ChatResponse> {
        self.items.iter().filter_map(|i| i.result.as_ref().ok())
    }

    /// Failed items as `(index, error)`.
    pub fn errors(&self) -> impl Iterator<Item = (usize, &Error)> {
        self.items
            .iter()
            .filter_map(|i| i.result.as_ref().err().map(|e| (i.index, e)))
    }

    pub fn total_cost(&self) -> f64 {
        self.responses().map(|r| r.cost).sum()
    }

    pub fn into_results(self) -> Vec<Result<ChatResponse, Error>> {
        self.items.into_iter().map(|i| i.result).collect()
    }
}

impl Session {
    /// Run one chat-shaped request per item, concurrently.
    ///
    /// `process` turns each item into a prompt (and optionally parameters).
    /// Results come back in input order and one item's failure never
    /// affects another unless `fail_fast` is set.
    pub async fn batch_generate<I, F, R>(
        &self,
        items: I,
        mut process: F,
        options: BatchOptions,
    ) -> Result<BatchReport, Error>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> R,
        R: Into<BatchRequest>,
    {
        let _in_flight = self.admit()?;

        let requests: Vec<(String, BatchRequest)> = items
            .into_iter()
            .map(|item| (self.next_request_id(), process(item).into()))
            .collect();
        let total = requests.len();

        let held: Vec<Option<PendingCharge<'_>>> = if options.check_budget_per_item {
            requests.iter().map(|_| None).collect()
        } else {
            let estimates: Vec<(String, f64)> = requests
                .iter()
                .map(|(request_id, request)| {
                    let estimate =
                        self.provider
                            .estimate_cost(&request.prompt, &self.model, &request.params);
                    (request_id.clone(), estimate)
                })
                .collect();

            match self.governor.reserve_all(&estimates) {
                Ok(reservations) => reservations
                    .into_iter()
                    .map(|r| Some(PendingCharge::new(&self.governor, r)))
                    .collect(),
                Err(exceeded) => {
                    warn!(
                        session_id = %self.id,
                        items = total,
                        error = %exceeded,
                        "Batch refused as a whole"
                    );
                    let error = Error::from(exceeded);
                    if options.fail_fast {
                        return Err(error);
                    }
                    let items = requests
                        .into_iter()
                        .enumerate()
                        .map(|(index, (request_id, request))| BatchItem {
                            index,
                            request_id,
                            prompt: request.prompt,
                            result: Err(error.clone()),
                        })
                        .collect();
                    return Ok(BatchReport { items });
                }
            }
        };

        let limit = options
            .max_concurrent
            .or(self.max_concurrent)
            .unwrap_or(total)
            .max(1);
        info!(
            session_id = %self.id,
            items = total,
            max_concurrent = limit,
            all_or_nothing = !options.check_budget_per_item,
            "Batch started"
        );

        let mut outcomes = pin!(
            stream::iter(requests.into_iter().zip(held).enumerate())
                .map(|(index, ((request_id, request), charge))| async move {
                    let prompt = request.prompt.clone();
                    let result = self
                        .run_request(request_id.clone(), request.prompt, request.params, charge)
                        .await;
                    BatchItem {
                        index,
                        request_id,
                        prompt,
                        result,
                    }
                })
                .buffered(limit)
        );

        let mut items = Vec::with_capacity(total);
        while let Some(item) = outcomes.next().await {
            if options.fail_fast {
                if let Err(err) = &item.result {
                    warn!(
                        session_id = %self.id,
                        index = item.index,
                        error = %err,
                        "Batch aborted on first failure"
                    );
                    // Dropping the stream cancels the remaining requests and
                    // releases their holds.
                    return Err(err.clone());
                }
            }
            items.push(item);
        }

        let report = BatchReport { items };
        info!(
            session_id = %self.id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            cost = report.total_cost(),
            "Batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::types::{ChatRequest, ProviderReply};
    use crate::providers::{ModelPricing, Provider, ProviderError};
    use futures::future::BoxFuture;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Echoes the prompt; prompts starting with "fail" error out. Later
    /// items finish first so ordering is exercised.
    struct Echo {
        calls: AtomicU32,
    }

    impl Provider for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn pricing(&self, _model: &str) -> Option<ModelPricing> {
            Some(ModelPricing::new("m", 1.0, 1.0))
        }

        fn send(
            &self,
            request: &ChatRequest,
        ) -> BoxFuture<'_, Result<ProviderReply, ProviderError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = request.prompt.clone();
            let model = request.model.clone();
            Box::pin(async move {
                let delay = 50u64.saturating_sub(prompt.len() as u64 * 5);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if prompt.starts_with("fail") {
                    return Err(ProviderError::Malformed(prompt));
                }
                Ok(ProviderReply {
                    content: prompt.to_uppercase(),
                    model,
                    input_tokens: 10,
                    output_tokens: 10,
                    finish_reason: None,
                })
            })
        }
    }

    fn session(budget: Option<f64>) -> (Arc<Echo>, Session) {
        let provider = Arc::new(Echo {
            calls: AtomicU32::new(0),
        });
        let session = Session::new(provider.clone(), "m", budget);
        session.start().unwrap();
        (provider, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        let (_, session) = session(None);
        let report = session
            .batch_generate(["a", "bb", "ccc", "dddd"], |s| s, BatchOptions::default())
            .await
            .unwrap();

        let contents: Vec<_> = report.responses().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["A", "BB", "CCC", "DDDD"]);
        let indices: Vec<_> = report.items.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated() {
        let (_, session) = session(None);
        let report = session
            .batch_generate(
                vec!["ok", "fail-me", "fine"],
                |s: &str| s.to_string(),
                BatchOptions::default().with_max_concurrent(2),
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        let (index, error) = report.errors().next().unwrap();
        assert_eq!(index, 1);
        assert_eq!(error.kind(), ErrorKind::MalformedRequest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_returns_first_error() {
        let (_, session) = session(None);
        let err = session
            .batch_generate(
                ["ok", "fail", "later"],
                |s| s,
                BatchOptions::default().fail_fast(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRequest);
        assert_eq!(session.governor().open_reservations(), 0);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_or_nothing_refuses_whole_batch() {
        // Each item estimates 501 tokens in/out at $1/M, about $0.0005.
        let (provider, session) = session(Some(0.0012));
        let report = session
            .batch_generate(["a", "b", "c"], |s| s, BatchOptions::default().all_or_nothing())
            .await
            .unwrap();

        assert_eq!(report.failed(), 3);
        assert!(report
            .errors()
            .all(|(_, e)| e.kind() == ErrorKind::BudgetExceeded));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.governor().open_reservations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_item_admission_isolates_budget_failures() {
        let (provider, session) = session(Some(0.0012));
        let report = session
            .batch_generate(
                ["a", "b", "c"],
                |s| s,
                BatchOptions::default().with_max_concurrent(3),
            )
            .await
            .unwrap();

        // Two estimates fit, the third does not.
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_or_nothing_admits_when_group_fits() {
        let (_, session) = session(Some(1.0));
        let report = session
            .batch_generate(["x", "y"], |s| s, BatchOptions::default().all_or_nothing())
            .await
            .unwrap();
        assert_eq!(report.succeeded(), 2);
        assert_eq!(session.governor().open_reservations(), 0);
        assert_eq!(session.request_count(), 2);
    }

    #[tokio::test]
    async fn test_batch_requires_active_session() {
        let (_, session) = session(None);
        session.end();
        let err = session
            .batch_generate(["a"], |s| s, BatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionInactive);
    }

    #[test]
    fn test_batch_request_conversions() {
        let params = ChatParams::default().with_max_tokens(5);
        let request: BatchRequest = ("p".to_string(), params.clone()).into();
        assert_eq!(request.params, params);
        assert_eq!(BatchRequest::from("q").prompt, "q");
    }
}
