use std::sync::Arc;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type Classifier<E> = Arc<dyn Fn(&E) -> String + Send + Sync>;

/// How an operation error affects the circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Not recorded at all
    Skipped,
    /// Recorded as a failure with this classification
    Tracked(String),
    /// Recorded as a success
    Untracked,
}

/// Per-call error classification
///
/// By default every error is tracked and none are skipped. Skipping wins over
/// tracking when both match.
pub struct CallOptions<E> {
    tracked: Option<Predicate<E>>,
    skipped: Option<Predicate<E>>,
    classifier: Option<Classifier<E>>,
}

impl<E> Default for CallOptions<E> {
    fn default() -> Self {
        Self {
            tracked: None,
            skipped: None,
            classifier: None,
        }
    }
}

impl<E> Clone for CallOptions<E> {
    fn clone(&self) -> Self {
        Self {
            tracked: self.tracked.clone(),
            skipped: self.skipped.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

impl<E> std::fmt::Debug for CallOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("tracked", &self.tracked.is_some())
            .field("skipped", &self.skipped.is_some())
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

impl<E> CallOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only errors matching `predicate` count as failures
    pub fn track_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.tracked = Some(Arc::new(predicate));
        self
    }

    /// Errors matching `predicate` leave the metrics untouched
    pub fn skip_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.skipped = Some(Arc::new(predicate));
        self
    }

    /// Label stored with each failure record
    pub fn classify_with<C>(mut self, classifier: C) -> Self
    where
        C: Fn(&E) -> String + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn classify(&self, error: &E) -> ErrorClass {
        if self.skipped.as_ref().is_some_and(|skip| skip(error)) {
            return ErrorClass::Skipped;
        }
        let tracked = self.tracked.as_ref().map_or(true, |track| track(error));
        if !tracked {
            return ErrorClass::Untracked;
        }
        let label = match &self.classifier {
            Some(classifier) => classifier(error),
            None => short_type_name::<E>().to_string(),
        };
        ErrorClass::Tracked(label)
    }
}

fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
