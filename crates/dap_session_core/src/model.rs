//! Mutable state owned by one debug session: threads, loaded sources and pending stops.

use crate::protocol::{self, Source, StackFrame, SteppingGranularity, StoppedDetails, ThreadId};
use crate::source::{source_uri, UriIdentity};
use serde::Serialize;
use std::collections::HashMap;

/// A loaded source: its canonical URI plus the merged adapter descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSource {
    pub uri: String,
    pub raw: Source,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugThread {
    pub id: ThreadId,
    pub name: String,
    pub stopped: bool,
    pub stopped_details: Option<StoppedDetails>,
    call_stack: Vec<StackFrame>,
    total_frames: Option<i64>,
    pub last_stepping_granularity: Option<SteppingGranularity>,
}

impl DebugThread {
    pub fn new(id: ThreadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            stopped: false,
            stopped_details: None,
            call_stack: Vec::new(),
            total_frames: None,
            last_stepping_granularity: None,
        }
    }

    pub fn call_stack(&self) -> &[StackFrame] {
        &self.call_stack
    }

    pub fn total_frames(&self) -> Option<i64> {
        self.total_frames
    }

    pub fn clear_call_stack(&mut self) {
        self.call_stack.clear();
        self.total_frames = None;
    }

    /// Frames fetched from `start` onward replace whatever was cached from that index.
    pub fn set_frames(&mut self, start: usize, frames: Vec<StackFrame>, total_frames: Option<i64>) {
        self.call_stack.truncate(start);
        self.call_stack.extend(frames);
        if total_frames.is_some() {
            self.total_frames = total_frames;
        }
    }

    /// The frame focus should land on: the first one the adapter does not deemphasize.
    pub fn top_stack_frame(&self) -> Option<&StackFrame> {
        self.call_stack
            .iter()
            .find(|f| !f.is_deemphasized())
            .or_else(|| self.call_stack.first())
    }

    fn mark_running(&mut self) {
        self.clear_call_stack();
        self.stopped_details = None;
        self.stopped = false;
    }
}

#[derive(Debug, Default)]
pub struct SessionModel {
    threads: HashMap<ThreadId, DebugThread>,
    thread_order: Vec<ThreadId>,
    sources: HashMap<String, Source>,
    stopped_details: Vec<StoppedDetails>,
}

impl SessionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(&self, id: ThreadId) -> Option<&DebugThread> {
        self.threads.get(&id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut DebugThread> {
        self.threads.get_mut(&id)
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_order.clone()
    }

    pub fn threads(&self) -> Vec<DebugThread> {
        self.thread_order
            .iter()
            .filter_map(|id| self.threads.get(id).cloned())
            .collect()
    }

    pub fn any_thread_stopped(&self) -> bool {
        self.threads.values().any(|t| t.stopped)
    }

    /// Replaces the thread list with a fresh `threads` response.
    ///
    /// Threads that survive the refresh keep their identity (and cached stacks); threads
    /// the adapter no longer reports are dropped. When `stopped` is given, the stop is
    /// applied to the thread it names, or to every thread if all stopped together.
    pub fn raw_update(&mut self, threads: Vec<protocol::Thread>, stopped: Option<&StoppedDetails>) {
        let mut order = Vec::with_capacity(threads.len());
        for thread in threads {
            order.push(thread.id);
            match self.threads.get_mut(&thread.id) {
                Some(existing) => {
                    if !thread.name.is_empty() {
                        existing.name = thread.name;
                    }
                }
                None => {
                    self.threads
                        .insert(thread.id, DebugThread::new(thread.id, thread.name));
                }
            }
        }
        self.threads.retain(|id, _| order.contains(id));
        self.thread_order = order;

        let Some(stopped) = stopped else {
            return;
        };
        if stopped.all_threads_stopped {
            for thread in self.threads.values_mut() {
                thread.stopped_details = if Some(thread.id) == stopped.thread_id {
                    Some(stopped.clone())
                } else {
                    let reason = thread
                        .stopped_details
                        .as_ref()
                        .map(|d| d.reason.clone())
                        .unwrap_or_else(|| stopped.reason.clone());
                    Some(StoppedDetails::placeholder(reason))
                };
                thread.stopped = true;
                thread.clear_call_stack();
            }
        } else if let Some(thread) = stopped.thread_id.and_then(|id| self.threads.get_mut(&id)) {
            thread.stopped_details = Some(stopped.clone());
            thread.clear_call_stack();
            thread.stopped = true;
        }
    }

    /// Marks one thread (or every thread) as running. With `remove` the threads are also
    /// dropped from the model.
    pub fn clear_threads(&mut self, remove: bool, reference: Option<ThreadId>) {
        match reference {
            Some(id) => {
                if let Some(thread) = self.threads.get_mut(&id) {
                    thread.mark_running();
                    if remove {
                        self.threads.remove(&id);
                        self.thread_order.retain(|t| *t != id);
                    }
                }
            }
            None => {
                for thread in self.threads.values_mut() {
                    thread.mark_running();
                }
                if remove {
                    self.threads.clear();
                    self.thread_order.clear();
                }
            }
        }
    }

    pub fn push_stopped_details(&mut self, details: StoppedDetails) {
        self.stopped_details.push(details);
    }

    /// The oldest stop that has not been drained yet.
    pub fn stopped_details(&self) -> Option<&StoppedDetails> {
        self.stopped_details.first()
    }

    pub fn pending_stops(&self) -> &[StoppedDetails] {
        &self.stopped_details
    }

    pub fn drop_stopped_details(&mut self, thread: Option<ThreadId>) {
        match thread {
            Some(id) => self.stopped_details.retain(|d| d.thread_id != Some(id)),
            None => self.stopped_details.clear(),
        }
    }

    /// Empties the queue and hands back the oldest stop, which is the one worth replaying
    /// after the adapter invalidates thread state.
    pub fn take_oldest_stop(&mut self) -> Option<StoppedDetails> {
        let oldest = self.stopped_details.first().cloned();
        self.stopped_details.clear();
        oldest
    }

    /// Resolves an adapter descriptor to the single Source instance for its canonical URI,
    /// merging new fields into an existing entry.
    pub fn resolve_source(
        &mut self,
        raw: &Source,
        session_id: &str,
        identity: &dyn UriIdentity,
    ) -> ResolvedSource {
        let uri = identity.canonical(&source_uri(raw, session_id));
        let raw = match self.sources.get_mut(&uri) {
            Some(existing) => {
                existing.merge(raw);
                existing.clone()
            }
            None => {
                self.sources.insert(uri.clone(), raw.clone());
                raw.clone()
            }
        };
        ResolvedSource { uri, raw }
    }

    pub fn source_for_uri(&self, uri: &str) -> Option<&Source> {
        self.sources.get(uri)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PathIdentity;

    fn thread(id: ThreadId, name: &str) -> protocol::Thread {
        protocol::Thread {
            id,
            name: name.to_string(),
        }
    }

    fn stop(thread_id: ThreadId, reason: &str, all: bool) -> StoppedDetails {
        StoppedDetails {
            reason: reason.to_string(),
            thread_id: Some(thread_id),
            all_threads_stopped: all,
            ..StoppedDetails::default()
        }
    }

    #[test]
    fn raw_update_preserves_identity_and_drops_missing_threads() {
        let mut model = SessionModel::new();
        model.raw_update(vec![thread(1, "main"), thread(2, "worker")], None);
        model
            .thread_mut(1)
            .expect("thread 1")
            .set_frames(0, vec![StackFrame::default()], Some(1));

        model.raw_update(vec![thread(1, ""), thread(3, "io")], None);

        assert_eq!(model.thread_ids(), vec![1, 3]);
        let main = model.thread(1).expect("thread 1 kept");
        assert_eq!(main.name, "main");
        assert_eq!(main.call_stack().len(), 1, "cached stack survives refresh");
        assert!(model.thread(2).is_none());
    }

    #[test]
    fn all_threads_stopped_gives_siblings_placeholder_details() {
        let mut model = SessionModel::new();
        model.raw_update(vec![thread(5, "a"), thread(7, "b")], None);

        let details = StoppedDetails {
            description: Some("Paused on breakpoint".into()),
            hit_breakpoint_ids: Some(vec![1]),
            ..stop(5, "breakpoint", true)
        };
        model.raw_update(vec![thread(5, "a"), thread(7, "b")], Some(&details));

        let primary = model.thread(5).expect("thread 5");
        assert_eq!(primary.stopped_details.as_ref(), Some(&details));
        let sibling = model.thread(7).expect("thread 7");
        assert!(sibling.stopped);
        let placeholder = sibling.stopped_details.as_ref().expect("placeholder");
        assert_eq!(placeholder.reason, "breakpoint");
        assert!(placeholder.description.is_none());
        assert!(placeholder.hit_breakpoint_ids.is_none());
    }

    #[test]
    fn single_thread_stop_only_touches_that_thread() {
        let mut model = SessionModel::new();
        model.raw_update(vec![thread(5, "a"), thread(7, "b")], Some(&stop(7, "step", false)));

        assert!(model.thread(7).expect("thread 7").stopped);
        assert!(!model.thread(5).expect("thread 5").stopped);
        assert!(model.any_thread_stopped());
    }

    #[test]
    fn clear_threads_resets_or_removes() {
        let mut model = SessionModel::new();
        model.raw_update(vec![thread(1, "a"), thread(2, "b")], Some(&stop(1, "pause", true)));

        model.clear_threads(false, Some(1));
        assert!(!model.thread(1).expect("kept").stopped);
        assert!(model.thread(2).expect("kept").stopped);

        model.clear_threads(true, Some(2));
        assert_eq!(model.thread_ids(), vec![1]);

        model.clear_threads(true, None);
        assert!(model.threads().is_empty());
    }

    #[test]
    fn stopped_details_queue_is_oldest_first() {
        let mut model = SessionModel::new();
        model.push_stopped_details(stop(5, "breakpoint", false));
        model.push_stopped_details(stop(7, "step", false));

        assert_eq!(model.stopped_details().and_then(|d| d.thread_id), Some(5));
        model.drop_stopped_details(Some(5));
        assert_eq!(model.stopped_details().and_then(|d| d.thread_id), Some(7));

        model.push_stopped_details(stop(9, "pause", false));
        let replay = model.take_oldest_stop().expect("queue not empty");
        assert_eq!(replay.thread_id, Some(7));
        assert!(model.pending_stops().is_empty());
    }

    #[test]
    fn equivalent_sources_resolve_to_one_entry() {
        let mut model = SessionModel::new();
        let first = Source {
            path: Some("/work/./src/main.rs".into()),
            presentation_hint: Some("emphasize".into()),
            ..Source::default()
        };
        let second = Source {
            path: Some("/work/src/main.rs".into()),
            origin: Some("build script".into()),
            ..Source::default()
        };

        let a = model.resolve_source(&first, "s1", &PathIdentity);
        let b = model.resolve_source(&second, "s1", &PathIdentity);

        assert_eq!(a.uri, b.uri);
        assert_eq!(model.source_count(), 1);
        assert_eq!(b.raw.origin.as_deref(), Some("build script"));
        assert_eq!(b.raw.presentation_hint, None);
    }

    #[test]
    fn top_stack_frame_skips_deemphasized_frames() {
        let mut t = DebugThread::new(1, "main");
        t.set_frames(
            0,
            vec![
                StackFrame {
                    id: 1,
                    presentation_hint: Some("subtle".into()),
                    ..StackFrame::default()
                },
                StackFrame {
                    id: 2,
                    ..StackFrame::default()
                },
            ],
            Some(2),
        );
        assert_eq!(t.top_stack_frame().map(|f| f.id), Some(2));
    }
}
