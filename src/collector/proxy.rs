use std::sync::Arc;

use super::{thread_pool::GCThreadPool, trace::TraceCollector, CollectorStrategy, GCReason};
use crate::{heap::RuntimeContext, param::GCParam};

/// Front of the collector used by the GC main thread. Picks a strategy per request and
/// forwards to the tracing collector.
pub(crate) struct CollectorProxy {
    context: Arc<RuntimeContext>,
    collector: TraceCollector,
}

impl CollectorProxy {
    pub fn new(context: Arc<RuntimeContext>, pool: GCThreadPool) -> Self {
        Self {
            collector: TraceCollector::new(context.clone(), pool),
            context,
        }
    }

    pub fn select_strategy(param: &GCParam, reason: GCReason) -> CollectorStrategy {
        let default = if param.enable_concurrent_gc {
            CollectorStrategy::Concurrent
        } else {
            CollectorStrategy::StopTheWorld
        };
        match reason {
            GCReason::Oom | GCReason::Force | GCReason::AppSpawn | GCReason::Backup => {
                CollectorStrategy::StopTheWorld
            }
            GCReason::Young if param.enable_young_gc => CollectorStrategy::Young,
            _ => default,
        }
    }

    pub fn run_gc(&mut self, reason: GCReason) {
        let strategy = Self::select_strategy(&self.context.param.gc, reason);
        self.context.gc_state.set_strategy(strategy);
        match strategy {
            CollectorStrategy::Concurrent => self.collector.run_concurrent(reason, false),
            CollectorStrategy::Young => self.collector.run_concurrent(reason, true),
            CollectorStrategy::StopTheWorld => self.collector.run_stop_the_world(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_follows_reason_and_param() {
        let mut param = GCParam::default();
        param.enable_young_gc = false;
        assert_eq!(
            CollectorProxy::select_strategy(&param, GCReason::Oom),
            CollectorStrategy::StopTheWorld
        );
        assert_eq!(
            CollectorProxy::select_strategy(&param, GCReason::Young),
            CollectorStrategy::Concurrent
        );
        param.enable_young_gc = true;
        assert_eq!(
            CollectorProxy::select_strategy(&param, GCReason::Young),
            CollectorStrategy::Young
        );
        param.enable_concurrent_gc = false;
        assert_eq!(
            CollectorProxy::select_strategy(&param, GCReason::Heu),
            CollectorStrategy::StopTheWorld
        );
    }
}
