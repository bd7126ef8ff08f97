//! The producer-facing profiler surface and its shared state.
//!
//! [`ProfilerState`] owns everything producers touch on the hot path: the
//! lazily-created per-thread contexts, the category enable flags, the frame
//! boundary inboxes, and the active-session handoff. Instrumentation calls
//! are fire-and-forget; nothing here ever blocks a producer except the
//! explicit stall honored in [`Profiler::end_frame`].

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

use crate::boundary::FrameBoundaries;
use crate::config::ProfilerConfig;
use crate::controller::{CaptureCompletion, CaptureRequest, Controller};
use crate::registry::CategoryRegistry;
use crate::sample::{
    CategoryId, CustomStatSample, EventSample, MarkerPhase, StatOp, Timeline, TimingMarker, Value,
};
use crate::thread::ThreadContext;
use crate::{current_tid, now_ns};

/// Per-capture information handed from the controller to producers.
pub struct SessionInfo {
    pub id: u64,
    pub started_at: u64,
    pub compress: bool,
}

// Each thread owns its contexts; the per-state registries hold only weak
// references, so a context dies with its thread (or with its state) and the
// registry observes the expiry.
thread_local! {
    static THREAD_CONTEXTS: RefCell<Vec<(Weak<ProfilerState>, Arc<ThreadContext>)>> =
        const { RefCell::new(Vec::new()) };
}

pub struct ProfilerState {
    pub(crate) boundaries: FrameBoundaries,
    pub(crate) categories: CategoryRegistry,
    registry: Mutex<Vec<Weak<ThreadContext>>>,
    /// Pseudo-thread for end-of-pipeline work not tied to an OS thread.
    end_of_pipe: Arc<ThreadContext>,
    session: ArcSwapOption<SessionInfo>,
    next_session_id: AtomicU64,
    writing_file: AtomicBool,
    /// 0 = no render thread designated.
    render_tid: AtomicU64,
    /// Passes producers should wait out before recording frame edges again.
    stall_passes: AtomicI64,
}

impl ProfilerState {
    pub(crate) fn new() -> Arc<Self> {
        let end_of_pipe = Arc::new(ThreadContext::new(0, "EndOfPipe".to_string()));
        end_of_pipe.set_timeline(Timeline::EndOfPipe);
        Arc::new(ProfilerState {
            boundaries: FrameBoundaries::new(),
            categories: CategoryRegistry::new(),
            registry: Mutex::new(Vec::new()),
            end_of_pipe,
            session: ArcSwapOption::const_empty(),
            next_session_id: AtomicU64::new(1),
            writing_file: AtomicBool::new(false),
            render_tid: AtomicU64::new(0),
            stall_passes: AtomicI64::new(0),
        })
    }

    pub(crate) fn thread_context(self: &Arc<Self>) -> Arc<ThreadContext> {
        THREAD_CONTEXTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            slots.retain(|(state, _)| state.strong_count() > 0);
            if let Some((_, ctx)) = slots
                .iter()
                .find(|(state, _)| std::ptr::eq(state.as_ptr(), Arc::as_ptr(self)))
            {
                return ctx.clone();
            }
            let tid = current_tid();
            let name = std::thread::current()
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Thread-{tid}"));
            let ctx = Arc::new(ThreadContext::new(tid, name));
            {
                let mut registry = self.registry.lock();
                registry.retain(|weak| weak.strong_count() > 0);
                registry.push(Arc::downgrade(&ctx));
            }
            slots.push((Arc::downgrade(self), ctx.clone()));
            ctx
        })
    }

    /// Every live thread context plus the end-of-pipe pseudo-thread. Expired
    /// entries from exited threads are pruned on the way.
    pub(crate) fn live_contexts(&self) -> Vec<Arc<ThreadContext>> {
        let mut registry = self.registry.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        let mut live: Vec<_> = registry.iter().filter_map(Weak::upgrade).collect();
        live.push(self.end_of_pipe.clone());
        live
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.session.load().is_some()
    }

    pub(crate) fn begin_session(&self, compress: bool) {
        self.session.store(Some(Arc::new(SessionInfo {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            started_at: now_ns(),
            compress,
        })));
    }

    pub(crate) fn end_session(&self) {
        self.session.store(None);
    }

    pub(crate) fn session_info(&self) -> Option<Arc<SessionInfo>> {
        self.session.load_full()
    }

    pub(crate) fn set_writing_file(&self, writing: bool) {
        self.writing_file.store(writing, Ordering::Relaxed);
    }

    pub(crate) fn is_writing_file(&self) -> bool {
        self.writing_file.load(Ordering::Relaxed)
    }

    pub(crate) fn set_render_thread(&self, tid: u64) {
        self.render_tid.store(tid, Ordering::Relaxed);
    }

    pub(crate) fn render_tid(&self) -> Option<u64> {
        match self.render_tid.load(Ordering::Relaxed) {
            0 => None,
            tid => Some(tid),
        }
    }

    pub(crate) fn request_stall(&self, passes: u32) {
        self.stall_passes.store(passes as i64, Ordering::Release);
    }

    /// One processing pass completed; lets stalled producers resume one pass
    /// earlier.
    pub(crate) fn complete_pass(&self) {
        let _ = self
            .stall_passes
            .fetch_update(Ordering::Release, Ordering::Acquire, |passes| {
                if passes > 0 {
                    Some(passes - 1)
                } else {
                    None
                }
            });
    }

    pub(crate) fn stalled(&self) -> bool {
        self.stall_passes.load(Ordering::Acquire) > 0
    }
}

/// The profiler instance: shared producer state plus the processing
/// controller. Share it by reference (or `Arc`) with every instrumented
/// thread.
pub struct Profiler {
    state: Arc<ProfilerState>,
    controller: Controller,
    config: ProfilerConfig,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> crate::Result<Self> {
        let state = ProfilerState::new();
        let controller = Controller::spawn(state.clone(), config.clone())?;
        Ok(Profiler {
            state,
            controller,
            config,
        })
    }

    pub(crate) fn state(&self) -> &Arc<ProfilerState> {
        &self.state
    }

    /// Records a primary-timeline frame edge. Call once per frame from the
    /// main thread.
    pub fn begin_frame(&self) {
        if self.state.is_capturing() {
            self.state
                .boundaries
                .add_begin_frame_timestamp(Timeline::Primary, now_ns());
        }
    }

    /// End of a primary-timeline frame. Drives processing synchronously in
    /// inline mode, and honors a stall request by waiting out a bounded
    /// number of processing passes.
    pub fn end_frame(&self) {
        if let Err(error) = self.controller.pump() {
            warn!(%error, "inline processing pass failed");
        }
        if self.config.inline_processing || !self.state.is_capturing() {
            return;
        }
        let cap_ms = (self.config.process_interval_ms
            * (self.config.stall_block_passes as u64 + 1)
            * 2)
            .min(1000);
        let mut waited = 0;
        while self.state.stalled() && waited < cap_ms {
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
    }

    /// Records a secondary-timeline frame edge. Call once per frame from the
    /// render-equivalent thread.
    pub fn begin_frame_secondary(&self) {
        if self.state.is_capturing() {
            self.state
                .boundaries
                .add_begin_frame_timestamp(Timeline::Secondary, now_ns());
        }
    }

    /// Frame-edge hook for symmetry; attribution uses the begin edge.
    pub fn end_frame_secondary(&self) {}

    /// Records an end-of-pipe frame edge. Rate-limited against the secondary
    /// timeline; must be called from a single thread.
    pub fn begin_frame_end_of_pipe(&self) {
        if self.state.is_capturing() {
            self.state
                .boundaries
                .add_begin_frame_timestamp(Timeline::EndOfPipe, now_ns());
        }
    }

    pub fn begin_stat(&self, name: &'static str, category: CategoryId) {
        self.push_marker(name, category, MarkerPhase::Begin, false);
    }

    pub fn end_stat(&self, name: &'static str, category: CategoryId) {
        self.push_marker(name, category, MarkerPhase::End, false);
    }

    /// Opens a mutually-exclusive top-level phase; an already-open exclusive
    /// phase is paused until this one ends.
    pub fn begin_exclusive(&self, name: &'static str) {
        self.push_marker(name, CategoryId::DEFAULT, MarkerPhase::Begin, true);
    }

    pub fn end_exclusive(&self, name: &'static str) {
        self.push_marker(name, CategoryId::DEFAULT, MarkerPhase::End, true);
    }

    fn push_marker(
        &self,
        name: &'static str,
        category: CategoryId,
        phase: MarkerPhase,
        exclusive: bool,
    ) {
        if !self.state.is_capturing() || !self.state.categories.is_enabled(category) {
            return;
        }
        self.state.thread_context().markers.push(TimingMarker {
            name,
            category,
            phase,
            exclusive,
            artificial: false,
            timestamp: now_ns(),
        });
    }

    pub fn record_custom_stat<V: Into<Value>>(
        &self,
        name: &'static str,
        category: CategoryId,
        value: V,
        op: StatOp,
    ) {
        if !self.state.is_capturing() || !self.state.categories.is_enabled(category) {
            return;
        }
        self.state.thread_context().stats.push(CustomStatSample {
            name,
            category,
            timestamp: now_ns(),
            op,
            value: value.into(),
        });
    }

    pub fn record_event(&self, category: CategoryId, text: impl Into<String>) {
        self.record_event_at(category, text, now_ns());
    }

    /// Records an event at an explicit historical timestamp.
    pub fn record_event_at(&self, category: CategoryId, text: impl Into<String>, timestamp: u64) {
        if !self.state.is_capturing() || !self.state.categories.is_enabled(category) {
            return;
        }
        self.state.thread_context().events.push(EventSample {
            text: text.into(),
            category,
            timestamp,
        });
    }

    pub fn register_category(&self, name: &str) -> CategoryId {
        self.state
            .categories
            .register(name, &self.config.disabled_categories)
    }

    pub fn set_category_enabled(&self, category: CategoryId, enabled: bool) {
        self.state.categories.set_enabled(category, enabled);
    }

    /// Designates the calling thread as the render-equivalent thread; its
    /// samples (and those of threads sharing its id) default to the
    /// secondary timeline.
    pub fn set_render_thread(&self) {
        self.state.set_render_thread(current_tid());
    }

    /// Marks the calling thread as a task worker; its series fold into the
    /// shared worker aggregate when folding is enabled.
    pub fn set_worker_thread(&self, is_worker: bool) {
        self.state.thread_context().set_is_worker(is_worker);
    }

    /// Pins the calling thread's samples to `timeline`, overriding the
    /// render-thread heuristic.
    pub fn set_thread_timeline(&self, timeline: Timeline) {
        self.state.thread_context().set_timeline(timeline);
    }

    pub fn begin_capture(&self, request: CaptureRequest) -> crate::Result<()> {
        self.controller.start(request)
    }

    /// Requests capture end. The returned completion resolves to the output
    /// path once the file is fully written.
    pub fn end_capture(&self) -> crate::Result<CaptureCompletion> {
        self.controller.stop()
    }

    pub fn is_capturing(&self) -> bool {
        self.state.is_capturing()
    }

    pub fn is_writing_file(&self) -> bool {
        self.state.is_writing_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilerConfig;
    use rstest::*;

    fn inline_profiler() -> Profiler {
        Profiler::new(ProfilerConfig {
            inline_processing: true,
            ..ProfilerConfig::default()
        })
        .unwrap()
    }

    #[rstest]
    fn test_stall_request_drains_per_pass() {
        let state = ProfilerState::new();
        assert!(!state.stalled());
        state.request_stall(2);
        assert!(state.stalled());
        state.complete_pass();
        assert!(state.stalled());
        state.complete_pass();
        assert!(!state.stalled());
        // Completing passes with no stall pending must not go negative.
        state.complete_pass();
        assert!(!state.stalled());
    }

    #[rstest]
    fn test_idle_instrumentation_records_nothing() {
        let profiler = inline_profiler();
        profiler.begin_frame();
        profiler.begin_stat("Tick", CategoryId::DEFAULT);
        profiler.end_stat("Tick", CategoryId::DEFAULT);
        profiler.record_custom_stat("DrawCalls", CategoryId::DEFAULT, 7, StatOp::Set);
        profiler.record_event(CategoryId::DEFAULT, "idle");

        let ctx = profiler.state().thread_context();
        assert!(!ctx.markers.has_pending());
        assert!(!ctx.stats.has_pending());
        assert!(!ctx.events.has_pending());
    }

    #[rstest]
    fn test_registry_prunes_exited_threads() {
        let profiler = inline_profiler();
        let state = profiler.state().clone();

        // Materialize this thread's context plus one on a short-lived thread.
        let _ = state.thread_context();
        std::thread::spawn({
            let state = state.clone();
            move || {
                let _ = state.thread_context();
            }
        })
        .join()
        .unwrap();

        // Live contexts: this thread plus the end-of-pipe pseudo-thread.
        let live = state.live_contexts();
        assert_eq!(live.len(), 2);
        assert!(live.iter().any(|c| c.name == "EndOfPipe"));
    }

    #[rstest]
    fn test_session_handoff() {
        let state = ProfilerState::new();
        assert!(state.session_info().is_none());
        state.begin_session(true);
        let info = state.session_info().unwrap();
        assert!(info.compress);
        assert_eq!(info.id, 1);
        state.end_session();
        assert!(!state.is_capturing());

        state.begin_session(false);
        assert_eq!(state.session_info().unwrap().id, 2);
    }

    #[rstest]
    fn test_disabled_category_drops_samples() {
        let profiler = Profiler::new(ProfilerConfig {
            inline_processing: true,
            disabled_categories: vec!["Lighting".to_string()],
            ..ProfilerConfig::default()
        })
        .unwrap();
        let lighting = profiler.register_category("Lighting");
        profiler.state().begin_session(false);

        profiler.begin_stat("Shadows", lighting);
        assert!(!profiler.state().thread_context().markers.has_pending());

        profiler.set_category_enabled(lighting, true);
        profiler.begin_stat("Shadows", lighting);
        assert!(profiler.state().thread_context().markers.has_pending());

        profiler.state().end_session();
    }
}
