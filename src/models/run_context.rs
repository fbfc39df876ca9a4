use crate::error::PipelineError;
use crate::models::config::MAX_PAIRS_CEILING;
use crate::models::pair::{PairConfig, PairState};

/// All pairs of one invocation, in registration order.
///
/// Registration enforces the pair limit, unique names, and usable names, so
/// every precondition failure surfaces before any stage runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    max_pairs: usize,
    pairs: Vec<PairState>,
}

impl RunContext {
    pub fn new(max_pairs: usize) -> Self {
        Self {
            max_pairs: max_pairs.min(MAX_PAIRS_CEILING),
            pairs: Vec::new(),
        }
    }

    /// Build a context from a full list, rejecting it as a whole if any
    /// registration would fail.
    pub fn from_pairs(max_pairs: usize, configs: Vec<PairConfig>) -> Result<Self, PipelineError> {
        let mut context = Self::new(max_pairs);
        if configs.len() > context.max_pairs {
            return Err(PipelineError::validation(
                None,
                format!(
                    "{} pairs requested but at most {} are allowed",
                    configs.len(),
                    context.max_pairs
                ),
            ));
        }

        for config in configs {
            context.register(config)?;
        }
        Ok(context)
    }

    pub fn register(&mut self, config: PairConfig) -> Result<(), PipelineError> {
        config.validate_name()?;

        if self.pairs.len() >= self.max_pairs {
            return Err(PipelineError::validation(
                Some(&config.pair_name),
                format!("pair limit of {} reached", self.max_pairs),
            ));
        }

        if self.get(&config.pair_name).is_some() {
            return Err(PipelineError::validation(
                Some(&config.pair_name),
                "duplicate pair name",
            ));
        }

        tracing::debug!("Registered pair {}", config.pair_name);
        self.pairs.push(PairState::new(config));
        Ok(())
    }

    /// Drop one pair; returns its last state if it was registered.
    pub fn clear(&mut self, pair_name: &str) -> Option<PairState> {
        let index = self.pairs.iter().position(|p| p.pair_name() == pair_name)?;
        Some(self.pairs.remove(index))
    }

    /// Forget every pair, keeping the limit.
    pub fn reset(&mut self) {
        self.pairs.clear();
    }

    pub fn max_pairs(&self) -> usize {
        self.max_pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[PairState] {
        &self.pairs
    }

    pub fn get(&self, pair_name: &str) -> Option<&PairState> {
        self.pairs.iter().find(|p| p.pair_name() == pair_name)
    }

    pub fn completed(&self) -> impl Iterator<Item = &PairState> {
        self.pairs.iter().filter(|p| p.is_complete())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PairState> {
        self.pairs.iter().filter(|p| p.is_failed())
    }

    /// Returns (completed, failed, total).
    pub fn summary(&self) -> (usize, usize, usize) {
        (
            self.completed().count(),
            self.failed().count(),
            self.pairs.len(),
        )
    }

    pub(crate) fn take_pairs(&mut self) -> Vec<PairState> {
        std::mem::take(&mut self.pairs)
    }

    pub(crate) fn restore_pairs(&mut self, pairs: Vec<PairState>) {
        self.pairs = pairs;
    }

    pub fn into_pairs(self) -> Vec<PairState> {
        self.pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::models::pair::PairStage;

    fn pair(name: &str) -> PairConfig {
        PairConfig::new(name, format!("/in/{}_a.dxf", name), format!("/in/{}_b.dxf", name))
    }

    #[test]
    fn test_register_preserves_order() {
        let mut context = RunContext::new(5);
        for name in ["C", "A", "B"] {
            context.register(pair(name)).unwrap();
        }
        let names: Vec<&str> = context.pairs().iter().map(|p| p.pair_name()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);
        assert!(context.pairs().iter().all(|p| p.stage() == PairStage::Registered));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut context = RunContext::new(5);
        context.register(pair("A")).unwrap();
        let err = context.register(pair("A")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn test_register_enforces_limit() {
        let mut context = RunContext::new(2);
        context.register(pair("A")).unwrap();
        context.register(pair("B")).unwrap();
        assert!(context.register(pair("C")).is_err());
    }

    #[test]
    fn test_limit_never_exceeds_ceiling() {
        let context = RunContext::new(50);
        assert_eq!(context.max_pairs(), MAX_PAIRS_CEILING);
    }

    #[test]
    fn test_from_pairs_rejects_overflow_without_registering() {
        let configs = (0..6).map(|i| pair(&format!("P{}", i))).collect();
        let err = RunContext::from_pairs(5, configs).unwrap_err();
        assert!(matches!(err, PipelineError::Validation { pair_name: None, .. }));
    }

    #[test]
    fn test_clear_and_reset() {
        let mut context = RunContext::from_pairs(5, vec![pair("A"), pair("B")]).unwrap();
        let removed = context.clear("A").unwrap();
        assert_eq!(removed.pair_name(), "A");
        assert!(context.clear("A").is_none());

        // A cleared name can be registered again
        context.register(pair("A")).unwrap();
        assert_eq!(context.len(), 2);

        context.reset();
        assert!(context.is_empty());
        assert_eq!(context.summary(), (0, 0, 0));
    }
}
