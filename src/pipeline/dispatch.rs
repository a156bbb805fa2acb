use std::sync::Arc;

use crate::{
    diagnostics::{Counter, PipelineStats},
    error::{PipelineError, Result},
    gesture::{ClassifierInput, ClassifierMode, ClassifierVariant},
    gloss_log::GlossLog,
    labels::{FALLBACK_LABEL, LabelSource},
    types::Classification,
};

/// Runs the selected classifier, resolves the gloss and records it.
///
/// Every classification is appended to the gloss log, whether or not it is
/// later published. Label table and log faults are counted and logged; they
/// never fail the classification.
pub struct ClassificationDispatcher {
    classifier: ClassifierVariant,
    labels: LabelSource,
    gloss_log: GlossLog,
    stats: Arc<PipelineStats>,
}

impl ClassificationDispatcher {
    pub fn new(
        classifier: ClassifierVariant,
        labels: LabelSource,
        gloss_log: GlossLog,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            classifier,
            labels,
            gloss_log,
            stats,
        }
    }

    pub fn mode(&self) -> ClassifierMode {
        self.classifier.mode()
    }

    pub fn classify(&mut self, input: &ClassifierInput<'_>) -> Result<Classification> {
        let id = self.classifier.classify(input).map_err(|err| {
            self.stats
                .record_fault(Counter::ClassifierFailures, format!("{err:#}"));
            PipelineError::Classifier(format!("{err:#}"))
        })?;
        self.stats.incr(Counter::Classifications);

        // The table is re-read every time so edits apply without a restart.
        let (label, resolved) = match self.labels.load() {
            Ok(table) => table.resolve(id),
            Err(err) => {
                log::warn!("{err}");
                self.stats
                    .record_fault(Counter::LabelTableFailures, err.to_string());
                (FALLBACK_LABEL.to_string(), false)
            }
        };

        if !resolved {
            log::debug!("no gloss for gesture id {id}, using fallback");
            self.stats.incr(Counter::UnknownGestures);
        }

        if let Err(err) = self.gloss_log.append(&label) {
            log::warn!("{err}");
            self.stats
                .record_fault(Counter::GlossLogFailures, err.to_string());
        }

        Ok(Classification {
            id,
            label,
            resolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gesture::StaticGestureClassifier,
        types::{GestureId, NormalizedVector},
    };
    use std::{fs, path::Path};
    use tempfile::TempDir;

    /// Returns the index of the largest component, like a trained model would
    /// be expected to do deterministically.
    struct LargestComponent;

    impl StaticGestureClassifier for LargestComponent {
        fn classify(&mut self, vector: &NormalizedVector) -> anyhow::Result<GestureId> {
            crate::gesture::argmax(vector.as_slice().iter().copied())
                .ok_or_else(|| anyhow::anyhow!("empty input"))
        }
    }

    struct Fixed(GestureId);

    impl StaticGestureClassifier for Fixed {
        fn classify(&mut self, _vector: &NormalizedVector) -> anyhow::Result<GestureId> {
            Ok(self.0)
        }
    }

    struct Broken;

    impl StaticGestureClassifier for Broken {
        fn classify(&mut self, _vector: &NormalizedVector) -> anyhow::Result<GestureId> {
            Err(anyhow::anyhow!("session lost"))
        }
    }

    fn write_table(dir: &Path, keys: std::ops::RangeInclusive<usize>) -> std::path::PathBuf {
        let path = dir.join("hand_sign_string.json");
        let table: serde_json::Map<String, serde_json::Value> = keys
            .map(|k| (k.to_string(), serde_json::Value::from(format!("sign {k}"))))
            .collect();
        fs::write(&path, serde_json::to_string(&table).unwrap()).unwrap();
        path
    }

    fn dispatcher(
        dir: &Path,
        classifier: impl StaticGestureClassifier,
        table: std::path::PathBuf,
    ) -> (ClassificationDispatcher, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let dispatcher = ClassificationDispatcher::new(
            ClassifierVariant::Static(Box::new(classifier)),
            LabelSource::new(table),
            GlossLog::new(dir.join("hand_sign.txt")),
            stats.clone(),
        );
        (dispatcher, stats)
    }

    fn input(shape: &NormalizedVector) -> ClassifierInput<'_> {
        ClassifierInput {
            shape,
            trajectory: &[],
        }
    }

    #[test]
    fn resolves_label_with_one_based_key() {
        let dir = TempDir::new().unwrap();
        let table = write_table(dir.path(), 1..=5);
        let (mut dispatcher, _) = dispatcher(dir.path(), Fixed(2), table);

        let shape = NormalizedVector(vec![0.0; 42]);
        let result = dispatcher.classify(&input(&shape)).unwrap();
        assert_eq!(result.id, 2);
        assert_eq!(result.label, "sign 3");
        assert!(result.resolved);
    }

    #[test]
    fn same_vector_same_result() {
        let dir = TempDir::new().unwrap();
        let table = write_table(dir.path(), 1..=6);
        let (mut dispatcher, _) = dispatcher(dir.path(), LargestComponent, table);

        let shape = NormalizedVector(vec![0.0, 0.0, 0.2, 1.0, -0.5, 0.3]);
        let first = dispatcher.classify(&input(&shape)).unwrap();
        let second = dispatcher.classify(&input(&shape)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id, 3);
    }

    #[test]
    fn miss_uses_fallback_and_logs_exactly_one_line() {
        let dir = TempDir::new().unwrap();
        let table = write_table(dir.path(), 1..=5);
        let (mut dispatcher, stats) = dispatcher(dir.path(), Fixed(5), table);

        let shape = NormalizedVector(vec![0.0; 42]);
        let result = dispatcher.classify(&input(&shape)).unwrap();
        assert_eq!(result.label, FALLBACK_LABEL);
        assert!(!result.resolved);

        let log = fs::read_to_string(dir.path().join("hand_sign.txt")).unwrap();
        assert_eq!(log, "Unknown sign\n");
        assert_eq!(stats.get(Counter::UnknownGestures), 1);
    }

    #[test]
    fn table_edits_apply_on_next_classification() {
        let dir = TempDir::new().unwrap();
        let table = write_table(dir.path(), 1..=1);
        let (mut dispatcher, _) = dispatcher(dir.path(), Fixed(1), table.clone());

        let shape = NormalizedVector(vec![0.0; 42]);
        assert_eq!(dispatcher.classify(&input(&shape)).unwrap().label, FALLBACK_LABEL);

        write_table(dir.path(), 1..=2);
        assert_eq!(dispatcher.classify(&input(&shape)).unwrap().label, "sign 2");
    }

    #[test]
    fn unreadable_table_degrades_to_fallback() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        let (mut dispatcher, stats) = dispatcher(dir.path(), Fixed(0), missing);

        let shape = NormalizedVector(vec![0.0; 42]);
        let result = dispatcher.classify(&input(&shape)).unwrap();
        assert_eq!(result.label, FALLBACK_LABEL);
        assert_eq!(stats.get(Counter::LabelTableFailures), 1);
        assert!(stats.last_fault().is_some());
    }

    #[test]
    fn log_failure_does_not_fail_classification() {
        let dir = TempDir::new().unwrap();
        let table = write_table(dir.path(), 1..=3);
        let stats = Arc::new(PipelineStats::new());
        let mut dispatcher = ClassificationDispatcher::new(
            ClassifierVariant::Static(Box::new(Fixed(0))),
            LabelSource::new(table),
            // a directory cannot be appended to
            GlossLog::new(dir.path()),
            stats.clone(),
        );

        let shape = NormalizedVector(vec![0.0; 42]);
        let result = dispatcher.classify(&input(&shape)).unwrap();
        assert_eq!(result.label, "sign 1");
        assert_eq!(stats.get(Counter::GlossLogFailures), 1);
    }

    #[test]
    fn classifier_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let table = write_table(dir.path(), 1..=3);
        let (mut dispatcher, stats) = dispatcher(dir.path(), Broken, table);

        let shape = NormalizedVector(vec![0.0; 42]);
        let err = dispatcher.classify(&input(&shape)).unwrap_err();
        assert!(matches!(err, PipelineError::Classifier(_)));
        assert_eq!(stats.get(Counter::ClassifierFailures), 1);
        assert!(!dir.path().join("hand_sign.txt").exists());
    }
}
