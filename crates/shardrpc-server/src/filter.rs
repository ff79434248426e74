use std::sync::{Arc, RwLock};

use bytes::Bytes;

use shardrpc_common::protocol::{Result, ShardRpcError};

use crate::context::RequestContext;

/// An interceptor around handler invocations.
///
/// For each request the chain invokes `on_request` in registration order
/// before the handler, then the matching `on_response` or `on_error` in
/// reverse order after it. An `on_request` may abort by returning an
/// error: the handler is not invoked and `on_error` runs for the filters
/// already entered. All hooks run on the worker thread executing the
/// request.
pub trait Filter: Send + Sync {
    fn on_request(&self, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    fn on_response(&self, _ctx: &RequestContext, _response: &Bytes) {}

    fn on_error(&self, _ctx: &RequestContext, _error: &ShardRpcError) {}
}

/// Ordered list of filters shared by the executor's workers.
///
/// Appending replaces the list whole, so an in-flight request keeps the
/// chain it started with.
pub struct FilterChain {
    filters: RwLock<Arc<Vec<Arc<dyn Filter>>>>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain {
            filters: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Appends filters to the end of the chain.
    pub fn add_filters(&self, filters: Vec<Arc<dyn Filter>>) {
        let mut current = self.filters.write().unwrap();
        let mut replacement = Vec::clone(&current);
        replacement.extend(filters);
        *current = Arc::new(replacement);
    }

    /// The chain as of now, for one request's lifetime.
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Filter>>> {
        self.filters.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.filters.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `invoke` inside the chain with the contract above.
pub(crate) fn run_chain<F>(
    chain: &[Arc<dyn Filter>],
    ctx: &mut RequestContext,
    invoke: F,
) -> Result<Bytes>
where
    F: FnOnce(&mut RequestContext) -> Result<Bytes>,
{
    for (entered, filter) in chain.iter().enumerate() {
        if let Err(error) = filter.on_request(ctx) {
            for prior in chain[..entered].iter().rev() {
                prior.on_error(ctx, &error);
            }
            return Err(error);
        }
    }

    let result = invoke(ctx);
    match &result {
        Ok(response) => {
            for filter in chain.iter().rev() {
                filter.on_response(ctx, response);
            }
        }
        Err(error) => {
            for filter in chain.iter().rev() {
                filter.on_error(ctx, error);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shardrpc_common::protocol::RequestEnvelope;
    use std::sync::Mutex;

    struct RecordingFilter {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_request: bool,
    }

    impl Filter for RecordingFilter {
        fn on_request(&self, _ctx: &mut RequestContext) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:request", self.name));
            if self.fail_request {
                Err(ShardRpcError::HandlerError(format!("{} aborted", self.name)))
            } else {
                Ok(())
            }
        }

        fn on_response(&self, _ctx: &RequestContext, _response: &Bytes) {
            self.log.lock().unwrap().push(format!("{}:response", self.name));
        }

        fn on_error(&self, _ctx: &RequestContext, _error: &ShardRpcError) {
            self.log.lock().unwrap().push(format!("{}:error", self.name));
        }
    }

    fn filter(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_request: bool,
    ) -> Arc<dyn Filter> {
        Arc::new(RecordingFilter {
            name,
            log: log.clone(),
            fail_request,
        })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(RequestEnvelope::request(1, "m", Bytes::new()))
    }

    #[test]
    fn test_response_unwinds_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new();
        chain.add_filters(vec![filter("a", &log, false), filter("b", &log, false)]);

        let result = run_chain(&chain.snapshot(), &mut ctx(), |_| {
            Ok(Bytes::from_static(b"ok"))
        });
        assert!(result.is_ok());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:request", "b:request", "b:response", "a:response"]
        );
    }

    #[test]
    fn test_handler_error_unwinds_on_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new();
        chain.add_filters(vec![filter("a", &log, false), filter("b", &log, false)]);

        let result = run_chain(&chain.snapshot(), &mut ctx(), |_| {
            Err(ShardRpcError::HandlerError("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:request", "b:request", "b:error", "a:error"]
        );
    }

    #[test]
    fn test_aborting_filter_skips_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new();
        chain.add_filters(vec![
            filter("a", &log, false),
            filter("b", &log, true),
            filter("c", &log, false),
        ]);

        let mut handler_ran = false;
        let result = run_chain(&chain.snapshot(), &mut ctx(), |_| {
            handler_ran = true;
            Ok(Bytes::new())
        });

        assert!(result.is_err());
        assert!(!handler_ran);
        // Only the filter entered before the aborting one unwinds; the
        // aborting filter and those after it never entered.
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:request", "b:request", "a:error"]
        );
    }

    #[test]
    fn test_filters_can_pass_attributes_to_handler() {
        struct Tagging;
        impl Filter for Tagging {
            fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
                ctx.set_attribute("tag", 7u32);
                Ok(())
            }
        }

        let chain = FilterChain::new();
        chain.add_filters(vec![Arc::new(Tagging)]);

        let mut seen = None;
        let _ = run_chain(&chain.snapshot(), &mut ctx(), |ctx| {
            seen = ctx.attribute::<u32>("tag").copied();
            Ok(Bytes::new())
        });
        assert_eq!(seen, Some(7));
    }

    #[test]
    fn test_snapshot_is_stable_across_append() {
        let chain = FilterChain::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        chain.add_filters(vec![filter("a", &log, false)]);

        let snapshot = chain.snapshot();
        chain.add_filters(vec![filter("b", &log, false)]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(chain.len(), 2);
    }
}
