//! Segment scheduler: keeps one composition playing and one prefetched.
//!
//! Every tick promotes a prefetched segment if there is one, asks the
//! composer for another when none is pending, plays the current segment and
//! sleeps for exactly the span it just scheduled. With nothing to play yet
//! it polls again after a short backoff. Stopping cancels the pending tick;
//! a composer reply that lands after the stop is thrown away.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::composer::{ComposeRequest, Composer};
use crate::config::SchedulerSettings;
use crate::engine::AudioEngine;
use crate::graph::AudioContext;
use crate::model::{Composition, NoteEvent};
use crate::task::TaskHandle;

/// Where segment notes are sent for playback.
pub trait SegmentPlayer: Send + Sync + 'static {
    fn play_segment(&self, notes: &[NoteEvent]);
}

impl<C: AudioContext> SegmentPlayer for Mutex<AudioEngine<C>> {
    fn play_segment(&self, notes: &[NoteEvent]) {
        if let Err(e) = self.lock().play_composition(notes) {
            warn!("segment not scheduled: {e}");
        }
    }
}

/// Seconds until the segment's last note ends, or `fallback` when there
/// is nothing to play.
pub fn segment_span(notes: &[NoteEvent], fallback: f64) -> f64 {
    notes
        .iter()
        .map(NoteEvent::end_time)
        .reduce(f64::max)
        .filter(|span| *span > 0.0)
        .unwrap_or(fallback)
}

/// Delay before the segment after one spanning `span` seconds. Spans past
/// the configured maximum, or that no `Duration` can hold, wait the
/// fallback segment length instead.
fn segment_wait(span: f64, settings: &SchedulerSettings) -> Duration {
    match Duration::try_from_secs_f64(span) {
        Ok(wait) if span <= settings.max_segment_seconds => wait,
        _ => {
            warn!(span, fallback = settings.fallback_segment_seconds, "segment span unusable");
            Duration::try_from_secs_f64(settings.fallback_segment_seconds)
                .unwrap_or_else(|_| settings.retry_backoff())
        }
    }
}

#[derive(Debug)]
struct SchedulerState {
    current: Option<Composition>,
    next: Option<Composition>,
    /// A composer request is in flight. Never more than one.
    generating: bool,
    /// Bumped on stop and on context change; replies from an older epoch
    /// are discarded.
    epoch: u64,
    request: ComposeRequest,
}

struct Inner<P, G> {
    player: Arc<P>,
    composer: Arc<G>,
    settings: SchedulerSettings,
    state: Arc<Mutex<SchedulerState>>,
}

impl<P, G> Clone for Inner<P, G> {
    fn clone(&self) -> Self {
        Inner {
            player: self.player.clone(),
            composer: self.composer.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
        }
    }
}

impl<P: SegmentPlayer, G: Composer> Inner<P, G> {
    /// Run one scheduler step and return the delay until the next one.
    fn tick(&self) -> Duration {
        let mut state = self.state.lock();
        if let Some(next) = state.next.take() {
            info!(name = %next.name, "next segment promoted");
            state.current = Some(next);
            self.prefetch(&mut state);
        } else if !state.generating {
            self.prefetch(&mut state);
        }

        let Some(current) = &state.current else {
            debug!("no segment yet, polling again");
            return self.settings.retry_backoff();
        };
        let notes = current.notes.clone();
        let span = segment_span(&notes, self.settings.fallback_segment_seconds);
        debug!(name = %current.name, span, "segment playing");
        drop(state);

        self.player.play_segment(&notes);
        segment_wait(span, &self.settings)
    }

    /// Ask the composer for the segment after the current one.
    fn prefetch(&self, state: &mut SchedulerState) {
        state.generating = true;
        let epoch = state.epoch;
        let mut request = state.request.clone();
        request.previous_track = state.current.as_ref().map(|c| c.name.clone());
        let composer = self.composer.clone();
        let shared = self.state.clone();

        tokio::spawn(async move {
            let result = composer.compose(&request).await;
            let mut state = shared.lock();
            state.generating = false;
            if state.epoch != epoch {
                debug!("stale composition discarded");
                return;
            }
            match result {
                Some(composition) => {
                    debug!(name = %composition.name, "segment prefetched");
                    state.next = Some(composition);
                }
                None => warn!("composer returned nothing, will retry"),
            }
        });
    }
}

pub struct SegmentScheduler<P, G> {
    inner: Inner<P, G>,
    task: Option<TaskHandle>,
}

impl<P: SegmentPlayer, G: Composer> SegmentScheduler<P, G> {
    pub fn new(player: Arc<P>, composer: Arc<G>, settings: SchedulerSettings, request: ComposeRequest) -> Self {
        SegmentScheduler {
            inner: Inner {
                player,
                composer,
                settings,
                state: Arc::new(Mutex::new(SchedulerState {
                    current: None,
                    next: None,
                    generating: false,
                    epoch: 0,
                    request,
                })),
            },
            task: None,
        }
    }

    /// Start ticking, optionally with a segment to play right away. Must be
    /// called inside a tokio runtime.
    pub fn start(&mut self, initial: Option<Composition>) {
        self.stop();
        if let Some(initial) = initial {
            self.inner.state.lock().current = Some(initial);
        }
        let inner = self.inner.clone();
        self.task = Some(TaskHandle::spawn(move |mut token| async move {
            loop {
                let delay = inner.tick();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }));
        info!("segment scheduler started");
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
            self.inner.state.lock().epoch += 1;
            info!("segment scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Change what future segments are composed for. The prefetched segment
    /// and any reply in flight are dropped; the current one keeps playing.
    pub fn set_request(&self, request: ComposeRequest) {
        let mut state = self.inner.state.lock();
        state.request = request;
        state.next = None;
        state.epoch += 1;
        if self.task.is_some() && !state.generating {
            self.inner.prefetch(&mut state);
        }
        debug!("composition context reset");
    }

    pub fn request(&self) -> ComposeRequest {
        self.inner.state.lock().request.clone()
    }

    pub fn current(&self) -> Option<Composition> {
        self.inner.state.lock().current.clone()
    }

    pub fn next(&self) -> Option<Composition> {
        self.inner.state.lock().next.clone()
    }

    pub fn is_generating(&self) -> bool {
        self.inner.state.lock().generating
    }
}

impl<P, G> Drop for SegmentScheduler<P, G> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
            self.inner.state.lock().epoch += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::ScriptedComposer;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        plays: Mutex<Vec<(Instant, usize)>>,
    }

    impl SegmentPlayer for Recorder {
        fn play_segment(&self, notes: &[NoteEvent]) {
            self.plays.lock().push((Instant::now(), notes.len()));
        }
    }

    impl Recorder {
        fn offsets(&self, from: Instant) -> Vec<Duration> {
            self.plays.lock().iter().map(|(t, _)| *t - from).collect()
        }
    }

    struct SlowComposer {
        delay: Duration,
        reply: Composition,
        calls: AtomicUsize,
    }

    impl Composer for SlowComposer {
        fn compose(&self, _request: &ComposeRequest) -> impl Future<Output = Option<Composition>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            let reply = self.reply.clone();
            async move {
                tokio::time::sleep(delay).await;
                Some(reply)
            }
        }
    }

    fn note(start: f64, duration: f64) -> NoteEvent {
        NoteEvent {
            pitch: "D3".into(),
            duration,
            start_time: start,
            velocity: 0.5,
        }
    }

    fn composition(name: &str, notes: Vec<NoteEvent>) -> Composition {
        Composition {
            name: name.into(),
            bpm: 40.0,
            key: None,
            notes,
            description: String::new(),
            tags: None,
        }
    }

    fn request() -> ComposeRequest {
        ComposeRequest::new("calm", 150.0, 2.5)
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn assert_offsets(actual: &[Duration], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!(a.abs_diff(secs(*e)) < Duration::from_millis(2), "{actual:?} vs {expected:?}");
        }
    }

    #[test]
    fn span_is_latest_end_or_fallback() {
        assert_eq!(segment_span(&[note(0.0, 4.0), note(10.0, 2.5)], 15.0), 12.5);
        assert_eq!(segment_span(&[], 15.0), 15.0);
    }

    #[tokio::test(start_paused = true)]
    async fn retriggers_after_exact_span() {
        let player = Arc::new(Recorder::default());
        let first = composition("Moonlit Drift", vec![note(0.0, 4.0), note(10.0, 2.5)]);
        let second = composition("Velvet Tide", vec![note(0.0, 8.0)]);
        let composer = Arc::new(ScriptedComposer::repeating(second.clone()));
        let mut scheduler = SegmentScheduler::new(player.clone(), composer.clone(), SchedulerSettings::default(), request());

        let t0 = Instant::now();
        scheduler.start(Some(first));
        tokio::time::sleep(secs(21.0)).await;

        // The second segment arrived long before 12.5 s but did not cut in.
        assert_offsets(&player.offsets(t0), &[0.0, 12.5, 20.5]);
        assert_eq!(scheduler.current(), Some(second));

        let previous: Vec<_> = composer.requests().into_iter().map(|r| r.previous_track).collect();
        assert_eq!(
            previous,
            vec![
                Some("Moonlit Drift".to_string()),
                Some("Velvet Tide".to_string()),
                Some("Velvet Tide".to_string())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_is_retried_after_backoff() {
        let player = Arc::new(Recorder::default());
        let composer = Arc::new(ScriptedComposer::repeating(composition("Hush", vec![note(0.0, 5.0)])));
        composer.push_reply(r#"{"name":"Broken","bpm":40}"#);
        let mut scheduler = SegmentScheduler::new(player.clone(), composer.clone(), SchedulerSettings::default(), request());

        let t0 = Instant::now();
        scheduler.start(None);
        tokio::time::sleep(secs(2.5)).await;

        assert_offsets(&player.offsets(t0), &[2.0]);
        assert_eq!(composer.requests().len(), 3);
    }

    #[test]
    fn unusable_spans_wait_the_fallback() {
        let settings = SchedulerSettings::default();
        assert_eq!(segment_wait(12.5, &settings), secs(12.5));
        assert_eq!(segment_wait(settings.max_segment_seconds + 1.0, &settings), secs(15.0));
        assert_eq!(segment_wait(1e20, &settings), secs(15.0));
        assert_eq!(segment_wait(f64::MAX, &settings), secs(15.0));
    }

    #[tokio::test(start_paused = true)]
    async fn endless_segment_does_not_stall_the_loop() {
        let endless = composition("Endless", vec![note(0.0, 1e20)]);
        let velvet = composition("Velvet Tide", vec![note(0.0, 8.0)]);
        let player = Arc::new(Recorder::default());
        let composer = Arc::new(ScriptedComposer::repeating(velvet.clone()));
        composer.push_reply(
            r#"{"name":"Endless","bpm":40,"notes":[{"pitch":"D3","duration":1e20,"startTime":0,"velocity":0.5}]}"#,
        );
        composer.push(Some(endless));
        let mut scheduler = SegmentScheduler::new(player.clone(), composer, SchedulerSettings::default(), request());

        let t0 = Instant::now();
        scheduler.start(None);
        tokio::time::sleep(secs(26.0)).await;

        // The parsed reply is rejected; the one that slips through plays for
        // the fallback length before the next segment takes over.
        assert_offsets(&player.offsets(t0), &[2.0, 17.0, 25.0]);
        assert!(scheduler.is_running());
        assert_eq!(scheduler.current(), Some(velvet));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_pending_tick() {
        let player = Arc::new(Recorder::default());
        let composer = Arc::new(ScriptedComposer::default());
        let mut scheduler = SegmentScheduler::new(player.clone(), composer, SchedulerSettings::default(), request());

        scheduler.start(Some(composition("A", vec![note(0.0, 3.0)])));
        tokio::time::sleep(secs(1.0)).await;
        scheduler.stop();
        assert!(!scheduler.is_running());
        tokio::time::sleep(secs(60.0)).await;

        assert_eq!(player.plays.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_after_stop_is_discarded() {
        let player = Arc::new(Recorder::default());
        let composer = Arc::new(SlowComposer {
            delay: secs(5.0),
            reply: composition("Late", vec![note(0.0, 2.0)]),
            calls: AtomicUsize::new(0),
        });
        let mut scheduler = SegmentScheduler::new(player, composer, SchedulerSettings::default(), request());

        scheduler.start(Some(composition("A", vec![note(0.0, 30.0)])));
        tokio::time::sleep(secs(1.0)).await;
        assert!(scheduler.is_generating());
        scheduler.stop();
        tokio::time::sleep(secs(10.0)).await;

        assert!(!scheduler.is_generating());
        assert_eq!(scheduler.next(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn one_request_in_flight_at_a_time() {
        let player = Arc::new(Recorder::default());
        let composer = Arc::new(SlowComposer {
            delay: secs(30.0),
            reply: composition("Slow", vec![note(0.0, 2.0)]),
            calls: AtomicUsize::new(0),
        });
        let mut scheduler = SegmentScheduler::new(player.clone(), composer.clone(), SchedulerSettings::default(), request());

        scheduler.start(None);
        tokio::time::sleep(secs(10.0)).await;
        assert_eq!(composer.calls.load(Ordering::SeqCst), 1);
        assert!(player.plays.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_request_drops_prefetched_segment() {
        let player = Arc::new(Recorder::default());
        let composer = Arc::new(ScriptedComposer::default());
        composer.push(Some(composition("Old mood", vec![note(0.0, 2.0)])));
        composer.push(Some(composition("New mood", vec![note(0.0, 2.0)])));
        let mut scheduler = SegmentScheduler::new(player, composer.clone(), SchedulerSettings::default(), request());

        scheduler.start(Some(composition("A", vec![note(0.0, 30.0)])));
        tokio::time::sleep(secs(1.0)).await;
        assert_eq!(scheduler.next().map(|c| c.name), Some("Old mood".to_string()));

        scheduler.set_request(ComposeRequest::new("rainy", 200.0, 6.0));
        tokio::time::sleep(secs(1.0)).await;
        assert_eq!(scheduler.next().map(|c| c.name), Some("New mood".to_string()));
        assert_eq!(composer.requests()[1].carrier_freq, 200.0);
    }
}
