//! Request/response hooks
//!
//! An explicit, ordered list of pre-request and post-response functions
//! invoked synchronously around each dispatch. The first hook that fails
//! short-circuits: remaining hooks are skipped and the error surfaces to
//! the caller (for a pre-hook, before any network attempt).

use meridian_error::Result;
use tracing::trace;

use crate::transport::{ApiRequest, ApiResponse};

type PreRequestHook = Box<dyn Fn(&mut ApiRequest) -> Result<()> + Send + Sync>;
type PostResponseHook = Box<dyn Fn(&ApiResponse) -> Result<()> + Send + Sync>;

/// Ordered hook chains around each outgoing attempt.
#[derive(Default)]
pub struct Hooks {
    pre: Vec<PreRequestHook>,
    post: Vec<PostResponseHook>,
}

impl Hooks {
    pub(crate) fn add_pre(
        &mut self,
        hook: impl Fn(&mut ApiRequest) -> Result<()> + Send + Sync + 'static,
    ) {
        self.pre.push(Box::new(hook));
    }

    pub(crate) fn add_post(
        &mut self,
        hook: impl Fn(&ApiResponse) -> Result<()> + Send + Sync + 'static,
    ) {
        self.post.push(Box::new(hook));
    }

    /// Run pre-request hooks in order; the first error aborts the dispatch.
    pub(crate) fn run_pre(&self, request: &mut ApiRequest) -> Result<()> {
        for (index, hook) in self.pre.iter().enumerate() {
            if let Err(err) = hook(request) {
                trace!(index, "pre-request hook short-circuited");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run post-response hooks in order; the first error discards the
    /// response from the caller's point of view.
    pub(crate) fn run_post(&self, response: &ApiResponse) -> Result<()> {
        for (index, hook) in self.post.iter().enumerate() {
            if let Err(err) = hook(response) {
                trace!(index, "post-response hook short-circuited");
                return Err(err);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_error::ApiError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn pre_hooks_run_in_order_and_may_mutate() {
        let mut hooks = Hooks::default();
        hooks.add_pre(|req| {
            req.headers.push(("X-First".into(), "1".into()));
            Ok(())
        });
        hooks.add_pre(|req| {
            req.headers.push(("X-Second".into(), "2".into()));
            Ok(())
        });

        let mut req = ApiRequest::get("/Tickets");
        hooks.run_pre(&mut req).unwrap();
        assert_eq!(req.headers[0].0, "X-First");
        assert_eq!(req.headers[1].0, "X-Second");
    }

    #[test]
    fn first_failure_short_circuits() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_late = ran.clone();

        let mut hooks = Hooks::default();
        hooks.add_pre(|_| Err(ApiError::unknown("rejected by hook")));
        hooks.add_pre(move |_| {
            ran_late.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut req = ApiRequest::get("/Tickets");
        assert!(hooks.run_pre(&mut req).is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
