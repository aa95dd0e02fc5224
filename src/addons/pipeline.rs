use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Addon, AddonContext, AddonError, Hook, Interception};
use crate::error::Error;
use crate::providers::types::ChatResponse;

struct Slot {
    addon: Arc<dyn Addon>,
    enabled: bool,
}

/// Ordered interceptors. Registration order governs both pre- and
/// post-request hooks.
///
/// Hooks run against a snapshot of the list taken when each phase starts, so
/// no lock is held while a hook is awaited.
#[derive(Default)]
pub struct AddonPipeline {
    slots: RwLock<Vec<Slot>>,
}

impl std::fmt::Debug for AddonPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonPipeline")
            .field("addons", &self.names())
            .finish()
    }
}

impl AddonPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -- registration --------------------------------------------------------

    /// Append an addon. An addon with the same name is replaced in place.
    pub fn add(&self, addon: Arc<dyn Addon>) {
        let mut slots = self.write();
        if let Some(slot) = slots.iter_mut().find(|s| s.addon.name() == addon.name()) {
            tracing::debug!(addon = %addon.name(), "Replacing registered addon");
            slot.addon = addon;
            slot.enabled = true;
            return;
        }
        tracing::debug!(addon = %addon.name(), position = slots.len(), "Addon registered");
        slots.push(Slot {
            addon,
            enabled: true,
        });
    }

    /// Remove an addon by name. Returns whether it was registered.
    pub fn remove(&self, name: &str) -> bool {
        let mut slots = self.write();
        let before = slots.len();
        slots.retain(|s| s.addon.name() != name);
        slots.len() != before
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Addon>> {
        self.read()
            .iter()
            .find(|s| s.addon.name() == name)
            .map(|s| Arc::clone(&s.addon))
    }

    /// Enable or disable an addon without changing its position.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.write().iter_mut().find(|s| s.addon.name() == name) {
            Some(slot) => {
                slot.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.read()
            .iter()
            .any(|s| s.addon.name() == name && s.enabled && s.addon.is_enabled())
    }

    pub fn names(&self) -> Vec<String> {
        self.read()
            .iter()
            .map(|s| s.addon.name().to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Retries the enabled addons may request for one request, summed.
    pub fn retry_cap(&self) -> u32 {
        self.active()
            .iter()
            .fold(0u32, |total, addon| total.saturating_add(addon.retry_cap()))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn active(&self) -> Vec<Arc<dyn Addon>> {
        self.read()
            .iter()
            .filter(|s| s.enabled && s.addon.is_enabled())
            .map(|s| Arc::clone(&s.addon))
            .collect()
    }

    // -- hook phases ---------------------------------------------------------

    /// Run pre-request hooks in order until one answers the request.
    ///
    /// Returns the answering addon's name with its interception. Any hook
    /// failure aborts the request.
    pub async fn run_pre_request(
        &self,
        ctx: &mut AddonContext,
    ) -> Result<Option<(String, Interception)>, Error> {
        for addon in self.active() {
            match addon.pre_request(ctx).await {
                Ok(None) => {}
                Ok(Some(interception)) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        addon = %addon.name(),
                        "Request short-circuited by pre-request hook"
                    );
                    return Ok(Some((addon.name().to_string(), interception)));
                }
                Err(err) => {
                    let message = err.to_string();
                    ctx.record_error(addon.name(), Hook::PreRequest, message.clone());
                    tracing::error!(
                        request_id = %ctx.request_id,
                        addon = %addon.name(),
                        error = %message,
                        "Pre-request hook failed, aborting request"
                    );
                    return Err(Error::AddonFailure {
                        addon: addon.name().to_string(),
                        hook: Hook::PreRequest,
                        message,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Chain post-request hooks over a response.
    ///
    /// A failing hook is logged and skipped, and the next hook sees the
    /// response as it was before the failure. A rejection ends the chain
    /// with [`Error::ValidationFailed`].
    pub async fn run_post_request(
        &self,
        response: ChatResponse,
        ctx: &mut AddonContext,
    ) -> Result<ChatResponse, Error> {
        let mut current = response;
        for addon in self.active() {
            match addon.post_request(current.clone(), ctx).await {
                Ok(next) => current = next,
                Err(AddonError::Rejected { message, retry }) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        addon = %addon.name(),
                        error = %message,
                        retry,
                        "Response rejected by post-request hook"
                    );
                    return Err(Error::ValidationFailed {
                        addon: addon.name().to_string(),
                        message,
                        retry_requested: retry,
                    });
                }
                Err(AddonError::Failed(message)) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        addon = %addon.name(),
                        error = %message,
                        "Post-request hook failed, skipping"
                    );
                    ctx.record_error(addon.name(), Hook::PostRequest, message);
                }
            }
        }
        Ok(current)
    }

    /// Run every error hook. Returns `true` if any of them asked for a
    /// retry. Failing hooks are logged and count as "no retry".
    pub async fn run_on_error(&self, error: &Error, ctx: &mut AddonContext) -> bool {
        let mut retry = false;
        for addon in self.active() {
            match addon.on_error(error, ctx).await {
                Ok(wants_retry) => retry |= wants_retry,
                Err(err) => {
                    let message = err.to_string();
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        addon = %addon.name(),
                        error = %message,
                        "Error hook failed, skipping"
                    );
                    ctx.record_error(addon.name(), Hook::OnError, message);
                }
            }
        }
        retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::providers::types::{ChatParams, ProviderReply};
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    /// Records every hook call into a shared trace and behaves as scripted.
    struct Scripted {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
        answer: Option<&'static str>,
        fail_pre: bool,
        post: Option<AddonError>,
        suffix: &'static str,
        retry: bool,
    }

    impl Scripted {
        fn new(name: &'static str, trace: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                trace: trace.clone(),
                answer: None,
                fail_pre: false,
                post: None,
                suffix: "",
                retry: false,
            }
        }

        fn log(&self, hook: &str) {
            self.trace.lock().unwrap().push(format!("{}:{hook}", self.name));
        }
    }

    impl Addon for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn pre_request<'a>(
            &'a self,
            _ctx: &'a mut AddonContext,
        ) -> BoxFuture<'a, Result<Option<Interception>, AddonError>> {
            Box::pin(async move {
                self.log("pre");
                if self.fail_pre {
                    return Err(AddonError::Failed("broken".into()));
                }
                Ok(self.answer.map(|a| Interception::estimated("", a)))
            })
        }

        fn post_request<'a>(
            &'a self,
            mut response: ChatResponse,
            _ctx: &'a mut AddonContext,
        ) -> BoxFuture<'a, Result<ChatResponse, AddonError>> {
            Box::pin(async move {
                self.log("post");
                if let Some(err) = &self.post {
                    response.content.push_str("-garbage");
                    return Err(err.clone());
                }
                response.content.push_str(self.suffix);
                Ok(response)
            })
        }

        fn on_error<'a>(
            &'a self,
            _error: &'a Error,
            _ctx: &'a mut AddonContext,
        ) -> BoxFuture<'a, Result<bool, AddonError>> {
            Box::pin(async move {
                self.log("error");
                Ok(self.retry)
            })
        }
    }

    fn context() -> AddonContext {
        AddonContext::new("s_1", "s", "prompt", "m", "p", ChatParams::default())
    }

    fn response(content: &str) -> ChatResponse {
        ChatResponse::from_reply(
            "s_1",
            ProviderReply {
                content: content.into(),
                model: "m".into(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: None,
            },
            0.0,
        )
    }

    #[tokio::test]
    async fn test_pre_request_short_circuits_in_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AddonPipeline::new();
        pipeline.add(Arc::new(Scripted::new("a", &trace)));
        pipeline.add(Arc::new(Scripted {
            answer: Some("cached"),
            ..Scripted::new("b", &trace)
        }));
        pipeline.add(Arc::new(Scripted::new("c", &trace)));

        let mut ctx = context();
        let (addon, interception) = pipeline.run_pre_request(&mut ctx).await.unwrap().unwrap();
        assert_eq!(addon, "b");
        assert_eq!(interception.content, "cached");
        assert_eq!(*trace.lock().unwrap(), vec!["a:pre", "b:pre"]);
    }

    #[tokio::test]
    async fn test_pre_request_failure_is_fatal() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AddonPipeline::new();
        pipeline.add(Arc::new(Scripted {
            fail_pre: true,
            ..Scripted::new("a", &trace)
        }));
        pipeline.add(Arc::new(Scripted::new("b", &trace)));

        let mut ctx = context();
        let err = pipeline.run_pre_request(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AddonFailure { ref addon, hook: Hook::PreRequest, .. } if addon == "a"
        ));
        assert_eq!(*trace.lock().unwrap(), vec!["a:pre"]);
        assert_eq!(ctx.addon_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_post_request_chains_and_skips_failures() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AddonPipeline::new();
        pipeline.add(Arc::new(Scripted {
            suffix: "-a",
            ..Scripted::new("a", &trace)
        }));
        pipeline.add(Arc::new(Scripted {
            post: Some(AddonError::Failed("sink offline".into())),
            ..Scripted::new("b", &trace)
        }));
        pipeline.add(Arc::new(Scripted {
            suffix: "-c",
            ..Scripted::new("c", &trace)
        }));

        let mut ctx = context();
        let out = pipeline
            .run_post_request(response("x"), &mut ctx)
            .await
            .unwrap();
        // b's partial edit is discarded.
        assert_eq!(out.content, "x-a-c");
        assert_eq!(ctx.addon_errors.len(), 1);
        assert_eq!(ctx.addon_errors[0].addon, "b");
    }

    #[tokio::test]
    async fn test_post_request_rejection_propagates() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AddonPipeline::new();
        pipeline.add(Arc::new(Scripted {
            post: Some(AddonError::Rejected {
                message: "not json".into(),
                retry: true,
            }),
            ..Scripted::new("validator", &trace)
        }));
        pipeline.add(Arc::new(Scripted::new("after", &trace)));

        let mut ctx = context();
        let err = pipeline
            .run_post_request(response("x"), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ValidationFailed { retry_requested: true, .. }
        ));
        assert_eq!(*trace.lock().unwrap(), vec!["validator:post"]);
    }

    #[tokio::test]
    async fn test_on_error_runs_all_and_ors_retry() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AddonPipeline::new();
        pipeline.add(Arc::new(Scripted::new("a", &trace)));
        pipeline.add(Arc::new(Scripted {
            retry: true,
            ..Scripted::new("b", &trace)
        }));
        pipeline.add(Arc::new(Scripted::new("c", &trace)));

        let mut ctx = context();
        let error = Error::from(ProviderError::Timeout("slow".into()));
        assert!(pipeline.run_on_error(&error, &mut ctx).await);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["a:error", "b:error", "c:error"]
        );
    }

    #[tokio::test]
    async fn test_disabled_addons_are_skipped() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AddonPipeline::new();
        pipeline.add(Arc::new(Scripted {
            answer: Some("never"),
            ..Scripted::new("a", &trace)
        }));
        assert!(pipeline.set_enabled("a", false));
        assert!(!pipeline.is_enabled("a"));

        let mut ctx = context();
        assert!(pipeline.run_pre_request(&mut ctx).await.unwrap().is_none());
        assert!(trace.lock().unwrap().is_empty());
        assert!(!pipeline.set_enabled("missing", true));
    }

    #[test]
    fn test_registration_management() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = AddonPipeline::new();
        pipeline.add(Arc::new(Scripted::new("a", &trace)));
        pipeline.add(Arc::new(Scripted::new("b", &trace)));
        pipeline.add(Arc::new(Scripted::new("a", &trace)));

        assert_eq!(pipeline.names(), vec!["a", "b"]);
        assert!(pipeline.get("b").is_some());
        assert!(pipeline.remove("a"));
        assert!(!pipeline.remove("a"));
        assert_eq!(pipeline.len(), 1);
        pipeline.clear();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_retry_cap_sums_enabled_addons() {
        use crate::addons::validator::{ResponseValidatorAddon, ValidationMode};
        use crate::addons::RetryAddon;
        use crate::providers::RetryPolicy;

        let pipeline = AddonPipeline::new();
        assert_eq!(pipeline.retry_cap(), 0);

        pipeline.add(Arc::new(RetryAddon::new(
            RetryPolicy::new().with_max_retries(4),
        )));
        pipeline.add(Arc::new(
            ResponseValidatorAddon::non_empty(ValidationMode::AutoRetry).with_max_retries(2),
        ));
        assert_eq!(pipeline.retry_cap(), 6);

        pipeline.set_enabled("retry", false);
        assert_eq!(pipeline.retry_cap(), 2);

        pipeline.add(Arc::new(ResponseValidatorAddon::non_empty(
            ValidationMode::Strict,
        )));
        assert_eq!(pipeline.retry_cap(), 0);
    }
}
