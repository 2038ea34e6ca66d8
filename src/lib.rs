//! Academic workflow and evaluation engine: phase windows, per-student
//! evaluation records with score conversion and publication, and external
//! evaluator balancing.

use std::sync::Arc;

pub mod api;
pub mod balancer;
pub mod clock;
pub mod config;
pub mod convert;
pub mod error;
pub mod evaluation;
pub mod handlers;
pub mod models;
pub mod report;
pub mod roster;
pub mod scheduler;
pub mod store;
pub mod window;

use balancer::EvaluatorBalancer;
use clock::Clock;
use config::EngineConfig;
use evaluation::EvaluationService;
use scheduler::ReconciliationScheduler;
use store::Store;
use window::WindowGate;

/// The wired-up services over one store and one clock.
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub gate: Arc<WindowGate>,
    pub evaluations: Arc<EvaluationService>,
    pub balancer: EvaluatorBalancer,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let gate = Arc::new(WindowGate::new(store.clone(), clock.clone()));
        let evaluations = Arc::new(EvaluationService::new(store.clone(), clock.clone()));
        let balancer = EvaluatorBalancer::new(store.clone(), evaluations.clone(), config.clone());
        Self {
            store,
            clock,
            config,
            gate,
            evaluations,
            balancer,
        }
    }

    /// A scheduler driving this engine's window gate. Not started.
    pub fn scheduler(&self) -> ReconciliationScheduler {
        ReconciliationScheduler::new(self.gate.clone(), self.config.clone())
    }
}
