//! RAII timing scopes: construction records the begin marker, drop records
//! the end marker on every exit path, early returns and panics included.

use crate::profiler::Profiler;
use crate::sample::CategoryId;

#[must_use = "a timing scope measures until it is dropped"]
pub struct TimingScope<'a> {
    profiler: &'a Profiler,
    name: &'static str,
    category: CategoryId,
    exclusive: bool,
    /// Disarmed scopes were opened while no capture was active; they must
    /// not emit a dangling end marker if a capture starts mid-scope.
    armed: bool,
}

impl Profiler {
    pub fn scope(&self, name: &'static str) -> TimingScope<'_> {
        self.scope_in(name, CategoryId::DEFAULT)
    }

    pub fn scope_in(&self, name: &'static str, category: CategoryId) -> TimingScope<'_> {
        let armed = self.is_capturing() && self.state().categories.is_enabled(category);
        if armed {
            self.begin_stat(name, category);
        }
        TimingScope {
            profiler: self,
            name,
            category,
            exclusive: false,
            armed,
        }
    }

    pub fn exclusive_scope(&self, name: &'static str) -> TimingScope<'_> {
        let armed = self.is_capturing();
        if armed {
            self.begin_exclusive(name);
        }
        TimingScope {
            profiler: self,
            name,
            category: CategoryId::DEFAULT,
            exclusive: true,
            armed,
        }
    }
}

impl Drop for TimingScope<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.exclusive {
            self.profiler.end_exclusive(self.name);
        } else {
            self.profiler.end_stat(self.name, self.category);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilerConfig;
    use crate::sample::{MarkerPhase, TimingMarker};
    use rstest::*;

    #[fixture]
    fn profiler() -> Profiler {
        Profiler::new(ProfilerConfig {
            inline_processing: true,
            ..ProfilerConfig::default()
        })
        .unwrap()
    }

    fn drain_markers(profiler: &Profiler) -> Vec<TimingMarker> {
        let mut out = Vec::new();
        profiler
            .state()
            .thread_context()
            .markers
            .drain_all(&mut out, -1);
        out
    }

    #[rstest]
    fn test_scope_emits_begin_end_pair(profiler: Profiler) {
        profiler.state().begin_session(false);
        {
            let _scope = profiler.scope("Tick");
        }
        let markers = drain_markers(&profiler);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].phase, MarkerPhase::Begin);
        assert_eq!(markers[1].phase, MarkerPhase::End);
        assert_eq!(markers[0].name, "Tick");
        assert!(markers[1].timestamp >= markers[0].timestamp);
        assert!(!markers[0].exclusive);
    }

    #[rstest]
    fn test_exclusive_scope_sets_flag(profiler: Profiler) {
        profiler.state().begin_session(false);
        {
            let _scope = profiler.exclusive_scope("RenderPhase");
        }
        let markers = drain_markers(&profiler);
        assert_eq!(markers.len(), 2);
        assert!(markers[0].exclusive);
        assert!(markers[1].exclusive);
    }

    #[rstest]
    fn test_idle_scope_records_nothing(profiler: Profiler) {
        {
            let _scope = profiler.scope("Tick");
        }
        assert!(drain_markers(&profiler).is_empty());
    }

    #[rstest]
    fn test_capture_starting_mid_scope_emits_no_dangling_end(profiler: Profiler) {
        let scope = profiler.scope("Tick");
        profiler.state().begin_session(false);
        drop(scope);
        assert!(drain_markers(&profiler).is_empty());
    }

    #[rstest]
    fn test_end_marker_emitted_on_panic(profiler: Profiler) {
        profiler.state().begin_session(false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = profiler.scope("Tick");
            panic!("instrumented code failed");
        }));
        assert!(result.is_err());
        assert_eq!(drain_markers(&profiler).len(), 2);
    }
}
