//! Flow-control engine for the upstream TCP delivery.
//!
//! One parking_lot mutex guards the delivery state, the overrun counters
//! and the timer generation. Every handler decides the transition under
//! the lock, releases it, then executes pipeline and sink effects, so a
//! re-entrant event can never deadlock. Timers are one-shot tasks that
//! carry the generation current when they were armed; a firing whose
//! generation no longer matches is a no-op.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::adjuster;
use super::monitor::BitrateMonitor;
use super::properties::SourcePropertyCache;
use super::sink::TransportSink;
use super::{
    FlowCounters, UpstreamState, LATENESS_BUDGET, MAX_OVERRUNS, OVERRUN_WINDOW, RESUME_DELAY,
    STATE_CHANGE_TIMEOUT,
};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::pipeline::{MediaPipeline, PipelineFault, QueueEvent, QueueWatch, SourceElement};

struct FlowState {
    state: UpstreamState,
    auto_bitrate: bool,
    counters: FlowCounters,
    generation: u64,
    waiting_timer: Option<AbortHandle>,
    resume_timer: Option<AbortHandle>,
    sink: Option<Arc<TransportSink>>,
}

pub struct UpstreamController {
    pipeline: Arc<dyn MediaPipeline>,
    events: Arc<EventBus>,
    fault_tx: mpsc::UnboundedSender<PipelineFault>,
    monitor: Arc<BitrateMonitor>,
    props: Arc<SourcePropertyCache>,
    flow: Mutex<FlowState>,
}

enum OverrunDecision {
    Ignore,
    /// First backlog right after connecting
    EnterWaiting,
    /// Below threshold: waiting timer armed, data-flow probe to arm
    Armed {
        generation: u64,
        sink: Option<Arc<TransportSink>>,
    },
    Overload {
        auto_bitrate: bool,
    },
}

impl UpstreamController {
    pub fn new(
        pipeline: Arc<dyn MediaPipeline>,
        events: Arc<EventBus>,
        fault_tx: mpsc::UnboundedSender<PipelineFault>,
        auto_bitrate: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            props: Arc::new(SourcePropertyCache::new(pipeline.clone())),
            monitor: Arc::new(BitrateMonitor::new()),
            pipeline,
            events,
            fault_tx,
            flow: Mutex::new(FlowState {
                state: UpstreamState::Disabled,
                auto_bitrate,
                counters: FlowCounters::default(),
                generation: 0,
                waiting_timer: None,
                resume_timer: None,
                sink: None,
            }),
        })
    }

    pub fn state(&self) -> UpstreamState {
        self.flow.lock().state
    }

    pub fn auto_bitrate(&self) -> bool {
        self.flow.lock().auto_bitrate
    }

    pub fn properties(&self) -> Arc<SourcePropertyCache> {
        self.props.clone()
    }

    /// Smoothed outbound bitrate in kbit/s, 0 while not measuring.
    pub fn measured_bitrate(&self) -> u32 {
        self.monitor.average()
    }

    /// Enabling auto-bitrate while overloaded resumes transmission right
    /// away; the next overload will then adjust the encoder.
    pub fn set_auto_bitrate(&self, enabled: bool) {
        let resume = {
            let mut flow = self.flow.lock();
            flow.auto_bitrate = enabled;
            enabled && flow.state == UpstreamState::Overload
        };
        if resume {
            self.resume_transmitting();
        }
    }

    /// Connect to the collector and start delivering. Only valid while
    /// disabled; a connect failure leaves everything untouched.
    ///
    /// `disable` is legal from `Connecting`, so a concurrent teardown can
    /// complete while this method is parked in an await. Every commit
    /// after an await re-verifies the generation captured when entering
    /// `Connecting` and unwinds when it has moved on.
    pub async fn enable(self: &Arc<Self>, host: &str, port: u16, token: Option<&str>) -> Result<()> {
        let generation = {
            let mut flow = self.flow.lock();
            if flow.state != UpstreamState::Disabled {
                return Err(AppError::WrongState(format!(
                    "cannot enable upstream while {}",
                    flow.state
                )));
            }
            flow.state = UpstreamState::Connecting;
            flow.generation += 1;
            flow.generation
        };

        if let Err(e) = self.pipeline.set_ready().await {
            self.abort_enable(generation);
            return Err(e);
        }
        if !self.still_connecting(generation) {
            return Err(AppError::WrongState("upstream disabled during enable".into()));
        }

        let sink = match TransportSink::connect(host, port, token).await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                self.abort_enable(generation);
                return Err(e);
            }
        };

        let queue = self.pipeline.queue();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                let Some(ctrl) = weak.upgrade() else { break };
                match event {
                    QueueEvent::Overrun => ctrl.on_overrun(),
                    QueueEvent::Underrun => ctrl.on_underrun().await,
                }
            }
        });

        let (flow_tx, mut flow_rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(generation) = flow_rx.recv().await {
                let Some(ctrl) = weak.upgrade() else { break };
                ctrl.on_data_flow(generation);
            }
        });

        // Commit: from here on a concurrent disable sees the sink and
        // tears it down itself
        let committed = {
            let mut flow = self.flow.lock();
            if flow.generation != generation || flow.state != UpstreamState::Connecting {
                false
            } else {
                queue.set_event_sender(queue_tx);
                queue.set_watch(Some(QueueWatch::Overrun));
                flow.counters.reset();
                flow.sink = Some(sink.clone());
                true
            }
        };
        if !committed {
            sink.shutdown().await;
            return Err(AppError::WrongState("upstream disabled during enable".into()));
        }
        self.events.publish(SystemEvent::UpstreamStateChanged {
            state: UpstreamState::Connecting.as_i32(),
        });
        info!("upstream enabled towards {host}:{port}");

        if let Err(e) = sink
            .attach(
                queue,
                self.monitor.clone(),
                self.events.clone(),
                self.fault_tx.clone(),
                flow_tx,
            )
            .await
        {
            let _ = self.disable().await;
            return Err(e);
        }

        if let Err(e) = self.pipeline.set_active(STATE_CHANGE_TIMEOUT).await {
            error!("pipeline refused to go active: {e}");
            let _ = self.disable().await;
            return Err(e);
        }
        // The first overrun may already have advanced the state, so the
        // only reliable sign of a concurrent disable here is our sink no
        // longer being the installed one
        let lost = {
            let flow = self.flow.lock();
            !flow.sink.as_ref().is_some_and(|s| Arc::ptr_eq(s, &sink))
        };
        if lost {
            // A concurrent disable tore everything down while the pipeline
            // went active; park it again to match
            if let Err(e) = self.pipeline.pause_sources().await {
                warn!("pausing sources after lost enable race failed: {e}");
            }
            if let Err(e) = self.pipeline.set_paused().await {
                warn!("pausing pipeline after lost enable race failed: {e}");
            }
            return Err(AppError::WrongState("upstream disabled during enable".into()));
        }
        Ok(())
    }

    /// Revert the `Connecting` commit, unless a concurrent disable (or a
    /// later enable) already moved the state machine on.
    fn abort_enable(&self, generation: u64) {
        let mut flow = self.flow.lock();
        if flow.generation == generation && flow.state == UpstreamState::Connecting {
            flow.state = UpstreamState::Disabled;
        }
    }

    fn still_connecting(&self, generation: u64) -> bool {
        let flow = self.flow.lock();
        flow.generation == generation && flow.state == UpstreamState::Connecting
    }

    /// Tear the delivery down. Valid from any enabled state; the sink
    /// writer is stopped and joined before anything else is touched, even
    /// if that means abandoning a write in flight.
    pub async fn disable(&self) -> Result<()> {
        let sink = {
            let mut flow = self.flow.lock();
            if flow.state == UpstreamState::Disabled {
                return Err(AppError::WrongState("upstream not enabled".to_string()));
            }
            flow.generation += 1;
            if let Some(timer) = flow.waiting_timer.take() {
                timer.abort();
            }
            if let Some(timer) = flow.resume_timer.take() {
                timer.abort();
            }
            flow.sink.take()
        };

        self.monitor.detach();
        if let Some(sink) = &sink {
            sink.clear_flow_probe();
            sink.shutdown().await;
        }
        if let Err(e) = self.pipeline.pause_sources().await {
            warn!("pausing sources during disable failed: {e}");
        }
        drop(sink);

        let queue = self.pipeline.queue();
        queue.set_watch(None);
        queue.flush();
        if let Err(e) = self.pipeline.set_paused().await {
            warn!("pausing pipeline during disable failed: {e}");
        }

        {
            let mut flow = self.flow.lock();
            flow.state = UpstreamState::Disabled;
            flow.counters.reset();
        }
        self.events.publish(SystemEvent::UpstreamStateChanged {
            state: UpstreamState::Disabled.as_i32(),
        });
        info!("upstream disabled");
        Ok(())
    }

    /// The queue filled past its bound.
    fn on_overrun(self: &Arc<Self>) {
        let decision = {
            let mut flow = self.flow.lock();
            match flow.state {
                UpstreamState::Connecting => OverrunDecision::EnterWaiting,
                UpstreamState::Transmitting => {
                    let now = Instant::now();
                    match flow.counters.window_start {
                        Some(start) if now.duration_since(start) > OVERRUN_WINDOW => {
                            flow.counters.overruns = 0;
                            flow.counters.window_start = Some(now);
                        }
                        None => flow.counters.window_start = Some(now),
                        _ => {}
                    }
                    flow.counters.overruns += 1;

                    if flow.waiting_timer.is_some() {
                        OverrunDecision::Ignore
                    } else if flow.counters.overruns >= MAX_OVERRUNS {
                        flow.state = UpstreamState::Overload;
                        let auto_bitrate = flow.auto_bitrate;
                        if auto_bitrate {
                            self.arm_resume_timer(&mut flow);
                        }
                        OverrunDecision::Overload { auto_bitrate }
                    } else {
                        self.arm_waiting_timer(&mut flow);
                        OverrunDecision::Armed {
                            generation: flow.generation,
                            sink: flow.sink.clone(),
                        }
                    }
                }
                UpstreamState::Overload => {
                    flow.counters.overruns += 1;
                    OverrunDecision::Ignore
                }
                _ => OverrunDecision::Ignore,
            }
        };

        match decision {
            OverrunDecision::Ignore => {}
            OverrunDecision::EnterWaiting => {
                debug!("first backlog after connect, holding capture");
                self.enter_waiting();
            }
            OverrunDecision::Armed { generation, sink } => {
                debug!("queue overrun, fallback to waiting armed");
                if let Some(sink) = sink {
                    sink.arm_flow_probe(generation);
                }
            }
            OverrunDecision::Overload { auto_bitrate } => {
                warn!("transport overloaded ({MAX_OVERRUNS} overruns within window)");
                self.events.publish(SystemEvent::UpstreamStateChanged {
                    state: UpstreamState::Overload.as_i32(),
                });
                if auto_bitrate {
                    self.adjust_bitrates();
                }
            }
        }
    }

    /// The queue drained while we were waiting for the transport to catch
    /// up; capture can resume.
    async fn on_underrun(&self) {
        {
            let flow = self.flow.lock();
            if flow.state != UpstreamState::Waiting {
                return;
            }
        }
        if let Err(e) = self.pipeline.resume_sources().await {
            warn!("cannot resume capture after underrun: {e}");
            return;
        }

        let sink = {
            let mut flow = self.flow.lock();
            if flow.state != UpstreamState::Waiting {
                return;
            }
            flow.generation += 1;
            flow.state = UpstreamState::Transmitting;
            if flow.counters.window_start.is_none() {
                flow.counters.window_start = Some(Instant::now());
            }
            flow.sink.clone()
        };

        if let Some(sink) = &sink {
            sink.set_lateness(None);
        }
        self.pipeline.queue().set_watch(Some(QueueWatch::Overrun));
        self.events.publish(SystemEvent::UpstreamStateChanged {
            state: UpstreamState::Transmitting.as_i32(),
        });
        self.monitor.attach();
        info!("transmitting");
    }

    /// A buffer reached the wire while a fallback to waiting was pending:
    /// data is flowing again, cancel the fallback.
    fn on_data_flow(&self, generation: u64) {
        let mut flow = self.flow.lock();
        if flow.generation != generation {
            return;
        }
        if let Some(timer) = flow.waiting_timer.take() {
            timer.abort();
            debug!("data flowing again, waiting fallback cancelled");
        }
    }

    /// Hold capture and let the transport drain the backlog.
    fn enter_waiting(&self) {
        let sink = {
            let mut flow = self.flow.lock();
            if !matches!(
                flow.state,
                UpstreamState::Transmitting | UpstreamState::Connecting
            ) {
                return;
            }
            flow.generation += 1;
            if let Some(timer) = flow.waiting_timer.take() {
                timer.abort();
            }
            flow.state = UpstreamState::Waiting;
            flow.counters.reset();
            flow.sink.clone()
        };

        if let Some(sink) = &sink {
            sink.set_lateness(Some(LATENESS_BUDGET));
            sink.clear_flow_probe();
        }
        self.events.publish(SystemEvent::UpstreamStateChanged {
            state: UpstreamState::Waiting.as_i32(),
        });
        self.monitor.detach();
        self.events
            .publish(SystemEvent::TcpBitrate { kbit_per_sec: 0 });
        self.pipeline.queue().set_watch(Some(QueueWatch::Underrun));

        let pipeline = self.pipeline.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.pause_sources().await {
                error!("cannot hold capture while waiting: {e}");
                events.publish(SystemEvent::SystemError {
                    module: "upstream".to_string(),
                    severity: "error".to_string(),
                    message: format!("pause capture failed: {e}"),
                });
            }
        });
        info!("waiting for transport to drain");
    }

    /// Leave overload without waiting for an underrun.
    fn resume_transmitting(&self) {
        {
            let mut flow = self.flow.lock();
            if flow.state != UpstreamState::Overload {
                return;
            }
            flow.generation += 1;
            if let Some(timer) = flow.resume_timer.take() {
                timer.abort();
            }
            flow.state = UpstreamState::Transmitting;
            flow.counters.overruns = 0;
            flow.counters.window_start = Some(Instant::now());
        }
        self.events.publish(SystemEvent::UpstreamStateChanged {
            state: UpstreamState::Transmitting.as_i32(),
        });
        info!("resuming transmission after overload");
    }

    /// Reduce encoder bitrates to what the transport demonstrably carries.
    fn adjust_bitrates(&self) {
        let average = self.monitor.average();
        if average == 0 {
            warn!("overloaded before any bitrate measurement, nothing to adjust");
            return;
        }
        let props = self.props.refresh();
        let (new_audio, new_video) = adjuster::reduced_bitrates(&props, average);

        if new_audio != props.audio_bitrate {
            if let Err(e) = self.props.set_bitrate(SourceElement::Audio, new_audio) {
                warn!("audio bitrate reduction failed: {e}");
                self.events.publish(SystemEvent::SystemError {
                    module: "upstream".to_string(),
                    severity: "warning".to_string(),
                    message: format!("audio bitrate reduction failed: {e}"),
                });
            }
        }
        if new_video != 0 && new_video != props.video_bitrate {
            if let Err(e) = self.props.set_bitrate(SourceElement::Video, new_video) {
                warn!("video bitrate reduction failed: {e}");
                self.events.publish(SystemEvent::SystemError {
                    module: "upstream".to_string(),
                    severity: "warning".to_string(),
                    message: format!("video bitrate reduction failed: {e}"),
                });
            }
        }
        info!(
            "bitrates reduced for overload: audio {} -> {new_audio}, video {} -> {new_video} (avg {average})",
            props.audio_bitrate, props.video_bitrate
        );
    }

    fn arm_waiting_timer(self: &Arc<Self>, flow: &mut FlowState) {
        let generation = flow.generation;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(RESUME_DELAY).await;
            let Some(ctrl) = weak.upgrade() else { return };
            let fire = {
                let mut flow = ctrl.flow.lock();
                if flow.generation != generation || flow.state != UpstreamState::Transmitting {
                    false
                } else {
                    flow.waiting_timer = None;
                    true
                }
            };
            if fire {
                ctrl.enter_waiting();
            }
        });
        flow.waiting_timer = Some(handle.abort_handle());
    }

    fn arm_resume_timer(self: &Arc<Self>, flow: &mut FlowState) {
        let generation = flow.generation;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(RESUME_DELAY).await;
            let Some(ctrl) = weak.upgrade() else { return };
            let fire = {
                let mut flow = ctrl.flow.lock();
                if flow.generation != generation || flow.state != UpstreamState::Overload {
                    false
                } else {
                    flow.resume_timer = None;
                    true
                }
            };
            if fire {
                ctrl.resume_transmitting();
            }
        });
        flow.resume_timer = Some(handle.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ElementCaps, EncoderPipeline, EncoderPipelineConfig, InputMode};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::sync::watch;

    struct Harness {
        ctrl: Arc<UpstreamController>,
        events: Arc<EventBus>,
        _listener: TcpListener,
        port: u16,
    }

    async fn harness(auto_bitrate: bool) -> Harness {
        let events = Arc::new(EventBus::new());
        let (fault_tx, _fault_rx) = unbounded_channel();
        let pipeline: Arc<dyn MediaPipeline> = Arc::new(EncoderPipeline::new(
            EncoderPipelineConfig::default(),
            events.clone(),
            fault_tx.clone(),
        ));
        let ctrl = UpstreamController::new(pipeline, events.clone(), fault_tx, auto_bitrate);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Harness {
            ctrl,
            events,
            _listener: listener,
            port,
        }
    }

    fn generation(ctrl: &UpstreamController) -> u64 {
        ctrl.flow.lock().generation
    }

    /// Pipeline wrapper whose lifecycle transitions can be held open, so a
    /// teardown can be interleaved with an in-flight enable.
    struct GatedPipeline {
        inner: Arc<dyn MediaPipeline>,
        ready_gate: watch::Receiver<bool>,
        active_gate: watch::Receiver<bool>,
    }

    impl GatedPipeline {
        async fn wait(gate: &watch::Receiver<bool>) {
            let mut gate = gate.clone();
            while !*gate.borrow() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    #[async_trait]
    impl MediaPipeline for GatedPipeline {
        async fn set_ready(&self) -> Result<()> {
            Self::wait(&self.ready_gate).await;
            self.inner.set_ready().await
        }
        async fn set_active(&self, timeout: Duration) -> Result<()> {
            Self::wait(&self.active_gate).await;
            self.inner.set_active(timeout).await
        }
        async fn set_paused(&self) -> Result<()> {
            self.inner.set_paused().await
        }
        async fn destroy(&self) {
            self.inner.destroy().await
        }
        async fn recreate(&self) -> Result<()> {
            self.inner.recreate().await
        }
        async fn pause_sources(&self) -> Result<()> {
            self.inner.pause_sources().await
        }
        async fn resume_sources(&self) -> Result<()> {
            self.inner.resume_sources().await
        }
        fn bitrate(&self, element: SourceElement) -> Option<u32> {
            self.inner.bitrate(element)
        }
        fn set_bitrate(&self, element: SourceElement, kbit: u32) {
            self.inner.set_bitrate(element, kbit)
        }
        fn caps(&self) -> Option<ElementCaps> {
            self.inner.caps()
        }
        fn set_caps(&self, caps: ElementCaps) {
            self.inner.set_caps(caps)
        }
        fn input_mode(&self) -> Option<InputMode> {
            self.inner.input_mode()
        }
        fn set_input_mode(&self, mode: InputMode) {
            self.inner.set_input_mode(mode)
        }
        fn queue(&self) -> Arc<crate::pipeline::StreamQueue> {
            self.inner.queue()
        }
    }

    /// Harness whose pipeline holds `set_ready` and `set_active` until the
    /// returned senders say otherwise.
    async fn gated_harness() -> (Harness, watch::Sender<bool>, watch::Sender<bool>) {
        let events = Arc::new(EventBus::new());
        let (fault_tx, _fault_rx) = unbounded_channel();
        let inner: Arc<dyn MediaPipeline> = Arc::new(EncoderPipeline::new(
            EncoderPipelineConfig::default(),
            events.clone(),
            fault_tx.clone(),
        ));
        let (ready_tx, ready_gate) = watch::channel(true);
        let (active_tx, active_gate) = watch::channel(true);
        let pipeline: Arc<dyn MediaPipeline> = Arc::new(GatedPipeline {
            inner,
            ready_gate,
            active_gate,
        });
        let ctrl = UpstreamController::new(pipeline, events.clone(), fault_tx, true);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (
            Harness {
                ctrl,
                events,
                _listener: listener,
                port,
            },
            ready_tx,
            active_tx,
        )
    }

    async fn transmit(h: &Harness) {
        h.ctrl.enable("127.0.0.1", h.port, None).await.unwrap();
        h.ctrl.on_overrun();
        assert_eq!(h.ctrl.state(), UpstreamState::Waiting);
        h.ctrl.on_underrun().await;
        assert_eq!(h.ctrl.state(), UpstreamState::Transmitting);
    }

    #[tokio::test]
    async fn test_enable_twice_fails_without_state_change() {
        let h = harness(true).await;
        h.ctrl.enable("127.0.0.1", h.port, None).await.unwrap();
        assert_eq!(h.ctrl.state(), UpstreamState::Connecting);

        let err = h.ctrl.enable("127.0.0.1", h.port, None).await;
        assert!(matches!(err, Err(AppError::WrongState(_))));
        assert_eq!(h.ctrl.state(), UpstreamState::Connecting);
    }

    #[tokio::test]
    async fn test_disable_requires_enabled() {
        let h = harness(true).await;
        assert!(h.ctrl.disable().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disabled() {
        let h = harness(true).await;
        // Port from a listener we immediately drop
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let result = h.ctrl.enable("127.0.0.1", closed_port, None).await;
        assert!(result.is_err());
        assert_eq!(h.ctrl.state(), UpstreamState::Disabled);
        // And a later enable still works
        h.ctrl.enable("127.0.0.1", h.port, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_wins_over_enable_parked_in_set_ready() {
        let (h, ready_tx, _active_tx) = gated_harness().await;
        ready_tx.send(false).unwrap();

        let ctrl = h.ctrl.clone();
        let port = h.port;
        let enable = tokio::spawn(async move { ctrl.enable("127.0.0.1", port, None).await });
        while h.ctrl.state() != UpstreamState::Connecting {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        h.ctrl.disable().await.unwrap();
        assert_eq!(h.ctrl.state(), UpstreamState::Disabled);

        ready_tx.send(true).unwrap();
        let result = enable.await.unwrap();
        assert!(matches!(result, Err(AppError::WrongState(_))));

        // The lost enable must leave no sink and not resurrect the state
        assert_eq!(h.ctrl.state(), UpstreamState::Disabled);
        assert!(h.ctrl.flow.lock().sink.is_none());

        // And a fresh enable still goes through
        h.ctrl.enable("127.0.0.1", h.port, None).await.unwrap();
        assert_eq!(h.ctrl.state(), UpstreamState::Connecting);
    }

    #[tokio::test]
    async fn test_disable_wins_over_enable_parked_in_set_active() {
        let (h, _ready_tx, active_tx) = gated_harness().await;
        active_tx.send(false).unwrap();

        let ctrl = h.ctrl.clone();
        let port = h.port;
        let enable = tokio::spawn(async move { ctrl.enable("127.0.0.1", port, None).await });
        // The sink is installed right before the pipeline goes active
        while h.ctrl.flow.lock().sink.is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        h.ctrl.disable().await.unwrap();
        assert_eq!(h.ctrl.state(), UpstreamState::Disabled);

        active_tx.send(true).unwrap();
        let result = enable.await.unwrap();
        assert!(matches!(result, Err(AppError::WrongState(_))));
        assert_eq!(h.ctrl.state(), UpstreamState::Disabled);
        assert!(h.ctrl.flow.lock().sink.is_none());
    }

    #[tokio::test]
    async fn test_first_overrun_after_connect_enters_waiting() {
        let h = harness(true).await;
        let mut rx = h.events.subscribe();
        h.ctrl.enable("127.0.0.1", h.port, None).await.unwrap();

        h.ctrl.on_overrun();
        assert_eq!(h.ctrl.state(), UpstreamState::Waiting);

        // connecting then waiting on the wire
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SystemEvent::UpstreamStateChanged { state } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_underrun_resumes_transmitting() {
        let h = harness(true).await;
        transmit(&h).await;
        assert_eq!(
            h.ctrl.pipeline.queue().watch(),
            Some(QueueWatch::Overrun)
        );
    }

    #[tokio::test]
    async fn test_underrun_ignored_outside_waiting() {
        let h = harness(true).await;
        h.ctrl.enable("127.0.0.1", h.port, None).await.unwrap();
        h.ctrl.on_underrun().await;
        assert_eq!(h.ctrl.state(), UpstreamState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_timer_falls_back_to_waiting() {
        let h = harness(true).await;
        transmit(&h).await;

        h.ctrl.on_overrun();
        assert_eq!(h.ctrl.state(), UpstreamState::Transmitting);
        assert!(h.ctrl.flow.lock().waiting_timer.is_some());

        tokio::time::sleep(RESUME_DELAY + Duration::from_millis(50)).await;
        assert_eq!(h.ctrl.state(), UpstreamState::Waiting);
        assert!(h.ctrl.flow.lock().waiting_timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_flow_cancels_waiting_fallback() {
        let h = harness(true).await;
        transmit(&h).await;

        h.ctrl.on_overrun();
        h.ctrl.on_data_flow(generation(&h.ctrl));
        assert!(h.ctrl.flow.lock().waiting_timer.is_none());

        tokio::time::sleep(RESUME_DELAY + Duration::from_millis(50)).await;
        assert_eq!(h.ctrl.state(), UpstreamState::Transmitting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_data_flow_generation_ignored() {
        let h = harness(true).await;
        transmit(&h).await;

        h.ctrl.on_overrun();
        h.ctrl.on_data_flow(generation(&h.ctrl) + 1);
        assert!(h.ctrl.flow.lock().waiting_timer.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_overrun_within_window_is_overload() {
        let h = harness(false).await;
        transmit(&h).await;

        for _ in 0..2 {
            h.ctrl.on_overrun();
            h.ctrl.on_data_flow(generation(&h.ctrl));
            assert_eq!(h.ctrl.state(), UpstreamState::Transmitting);
        }
        h.ctrl.on_overrun();
        assert_eq!(h.ctrl.state(), UpstreamState::Overload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_window_resets_counter() {
        let h = harness(false).await;
        transmit(&h).await;

        for _ in 0..2 {
            h.ctrl.on_overrun();
            h.ctrl.on_data_flow(generation(&h.ctrl));
        }
        tokio::time::sleep(OVERRUN_WINDOW + Duration::from_millis(50)).await;

        // A third overrun after the window expired starts a new count
        h.ctrl.on_overrun();
        assert_eq!(h.ctrl.state(), UpstreamState::Transmitting);
        assert_eq!(h.ctrl.flow.lock().counters.overruns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_without_auto_bitrate_stays_until_toggled() {
        let h = harness(false).await;
        transmit(&h).await;

        for _ in 0..2 {
            h.ctrl.on_overrun();
            h.ctrl.on_data_flow(generation(&h.ctrl));
        }
        h.ctrl.on_overrun();
        assert_eq!(h.ctrl.state(), UpstreamState::Overload);

        tokio::time::sleep(RESUME_DELAY * 3).await;
        assert_eq!(h.ctrl.state(), UpstreamState::Overload);

        h.ctrl.set_auto_bitrate(true);
        assert_eq!(h.ctrl.state(), UpstreamState::Transmitting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_with_auto_bitrate_resumes_after_delay() {
        let h = harness(true).await;
        transmit(&h).await;

        for _ in 0..2 {
            h.ctrl.on_overrun();
            h.ctrl.on_data_flow(generation(&h.ctrl));
        }
        h.ctrl.on_overrun();
        assert_eq!(h.ctrl.state(), UpstreamState::Overload);

        tokio::time::sleep(RESUME_DELAY + Duration::from_millis(50)).await;
        assert_eq!(h.ctrl.state(), UpstreamState::Transmitting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_adjusts_bitrates_from_average() {
        let h = harness(true).await;
        transmit(&h).await;

        // Seed the monitor with a 3000 kbit/s measurement
        tokio::time::advance(super::super::BITRATE_AVG_PERIOD + Duration::from_millis(1)).await;
        assert_eq!(h.ctrl.monitor.record(750_000), Some(3000));

        for _ in 0..2 {
            h.ctrl.on_overrun();
            h.ctrl.on_data_flow(generation(&h.ctrl));
        }
        h.ctrl.on_overrun();

        let props = h.ctrl.props.cached();
        assert_eq!(props.audio_bitrate, 128 * 8 / 10);
        assert_eq!(props.video_bitrate, (3000 - 128 * 8 / 10) * 8 / 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_pending_timers() {
        let h = harness(true).await;
        transmit(&h).await;

        h.ctrl.on_overrun();
        assert!(h.ctrl.flow.lock().waiting_timer.is_some());

        h.ctrl.disable().await.unwrap();
        assert_eq!(h.ctrl.state(), UpstreamState::Disabled);
        assert!(h.ctrl.flow.lock().waiting_timer.is_none());

        tokio::time::sleep(RESUME_DELAY * 2).await;
        assert_eq!(h.ctrl.state(), UpstreamState::Disabled);
    }

    #[tokio::test]
    async fn test_disable_clears_queue_watch() {
        let h = harness(true).await;
        transmit(&h).await;
        h.ctrl.disable().await.unwrap();
        assert_eq!(h.ctrl.pipeline.queue().watch(), None);
    }
}
