//! Multi-producer/single-consumer animation pipeline.
//!
//! Each layer holder loans two preallocated buffers to its renderer
//! through a pair of bounded channels. Renderers draw at their own pace;
//! the loop wakes when at least one finished buffer arrives, drains the
//! rest opportunistically, composes in zindex order, and commits one
//! frame per tick, bounded at [`MAX_FPS`]. A paused loop consumes no CPU.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::ChromaDevice;
use crate::layer::Layer;
use crate::prefs::{LayerPrefs, Preferences};
use crate::renderer::{self, apply_traits, Renderer, MAX_FPS, NUM_BUFFERS};
use crate::traits::{TraitValue, TraitValues};
use crate::util::{Signal, Ticker};

/// Notification payload for layer list changes.
#[derive(Debug, Clone)]
pub struct LayersChangedEvent {
    pub action: &'static str,
    pub zindex: usize,
    pub renderer_key: String,
}

/// Notification payload for a live trait edit on a running layer.
#[derive(Debug, Clone)]
pub struct TraitsChangedEvent {
    pub zindex: usize,
    pub values: TraitValues,
    pub field: String,
    pub old: Option<TraitValue>,
}

struct LayerHolder {
    id: u64,
    key: String,
    renderer: Arc<AsyncMutex<Box<dyn Renderer>>>,
    running: Arc<AtomicBool>,
    free_tx: mpsc::Sender<Layer>,
    free_rx: Arc<AsyncMutex<mpsc::Receiver<Layer>>>,
    active_tx: mpsc::Sender<Layer>,
    active_rx: Arc<AsyncMutex<mpsc::Receiver<Layer>>>,
    current_buf: Option<Layer>,
    producer: Option<JoinHandle<()>>,
    waiter: Option<JoinHandle<()>>,
}

impl LayerHolder {
    fn new(id: u64, key: String, renderer: Box<dyn Renderer>, width: usize, height: usize) -> Self {
        let (free_tx, free_rx) = mpsc::channel(NUM_BUFFERS);
        let (active_tx, active_rx) = mpsc::channel(NUM_BUFFERS);

        for _ in 0..NUM_BUFFERS {
            free_tx
                .try_send(Layer::new(width, height))
                .expect("fresh channel has room for both buffers");
        }

        Self {
            id,
            key,
            renderer: Arc::new(AsyncMutex::new(renderer)),
            running: Arc::new(AtomicBool::new(false)),
            free_tx,
            free_rx: Arc::new(AsyncMutex::new(free_rx)),
            active_tx,
            active_rx: Arc::new(AsyncMutex::new(active_rx)),
            current_buf: None,
            producer: None,
            waiter: None,
        }
    }

    /// Return a buffer to the renderer's free queue, cleared and unlocked.
    fn free_buffer(&self, mut layer: Layer) {
        layer.lock(false);
        layer.clear();
        let _ = self.free_tx.try_send(layer);
    }

    fn start(&mut self, ready_tx: mpsc::UnboundedSender<(u64, Layer)>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        // producer: draw into free buffers at the renderer's own pace
        let renderer = Arc::clone(&self.renderer);
        let free_rx = Arc::clone(&self.free_rx);
        let free_tx = self.free_tx.clone();
        let active_tx = self.active_tx.clone();
        let running = Arc::clone(&self.running);

        self.producer = Some(tokio::spawn(async move {
            let mut ticker = Ticker::new(Duration::from_secs_f64(1.0 / MAX_FPS));

            while running.load(Ordering::SeqCst) {
                let fps = renderer.lock().await.props().fps();
                if fps > 0.0 {
                    ticker.set_interval(Duration::from_secs_f64(1.0 / fps.min(MAX_FPS)));
                }

                let Some(mut layer) = free_rx.lock().await.recv().await else {
                    break;
                };

                let drew = {
                    let mut r = renderer.lock().await;
                    let status = r.draw(&mut layer, Instant::now()).await;
                    if status {
                        layer.blend_mode = r.props().blend_mode;
                        layer.opacity = r.props().opacity as f32;
                        layer.background_color = r.props().background_color;
                    }
                    status
                };

                if !running.load(Ordering::SeqCst) {
                    break;
                }

                if drew {
                    layer.lock(true);
                    if active_tx.send(layer).await.is_err() {
                        break;
                    }
                } else {
                    layer.clear();
                    let _ = free_tx.send(layer).await;
                }

                ticker.tick().await;
            }
        }));

        // waiter: hand completed buffers to the loop
        let active_rx = Arc::clone(&self.active_rx);
        let id = self.id;
        self.waiter = Some(tokio::spawn(async move {
            loop {
                let buf = { active_rx.lock().await.recv().await };
                match buf {
                    Some(buf) => {
                        if ready_tx.send((id, buf)).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }));
    }

    async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(task) = self.producer.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.waiter.take() {
            task.abort();
            let _ = task.await;
        }
    }

    async fn trait_values(&self) -> TraitValues {
        self.renderer.lock().await.get_traits()
    }
}

/// Collects renderer output and displays the composited image.
pub struct AnimationLoop {
    device: Weak<ChromaDevice>,
    layers: AsyncMutex<Vec<LayerHolder>>,
    running: AtomicBool,
    error: AtomicBool,
    paused_tx: watch::Sender<bool>,
    /// Wake channel for the current run; replaced on every start.
    ready_tx: Mutex<mpsc::UnboundedSender<(u64, Layer)>>,
    anim_task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    pub layers_changed: Signal<LayersChangedEvent>,
    pub traits_changed: Signal<TraitsChangedEvent>,
    pub state_changed: Signal<String>,
}

impl AnimationLoop {
    pub fn new(device: Weak<ChromaDevice>) -> Arc<Self> {
        let (paused_tx, _) = watch::channel(false);
        let (ready_tx, _) = mpsc::unbounded_channel();

        Arc::new(Self {
            device,
            layers: AsyncMutex::new(Vec::new()),
            running: AtomicBool::new(false),
            error: AtomicBool::new(false),
            paused_tx,
            ready_tx: Mutex::new(ready_tx),
            anim_task: Mutex::new(None),
            next_id: AtomicU64::new(1),
            layers_changed: Signal::new(),
            traits_changed: Signal::new(),
            state_changed: Signal::new(),
        })
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn had_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub async fn layer_count(&self) -> usize {
        self.layers.lock().await.len()
    }

    /// Holder inventory for the loop invariant: buffers in the free and
    /// active queues plus the held current buffer, per holder.
    #[doc(hidden)]
    pub async fn buffer_accounting(&self) -> Vec<usize> {
        let layers = self.layers.lock().await;
        layers
            .iter()
            .map(|holder| {
                let free_len = holder.free_tx.max_capacity() - holder.free_tx.capacity();
                let active_len = holder.active_tx.max_capacity() - holder.active_tx.capacity();
                free_len + active_len + holder.current_buf.is_some() as usize
            })
            .collect()
    }

    /// Add a layer at the given zindex (append when None).
    ///
    /// The renderer's `init` may refuse; the loop is left undisturbed in
    /// that case. Starts the producer immediately when the loop runs.
    pub async fn add_layer(
        self: &Arc<Self>,
        key: String,
        mut renderer: Box<dyn Renderer>,
        zindex: Option<usize>,
    ) -> Option<usize> {
        let device = self.device.upgrade()?;
        let frame = device.frame_control()?;

        if !renderer.init(frame) {
            error!("Renderer {key} failed to initialize");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut holder = LayerHolder::new(id, key.clone(), renderer, device.width(), device.height());

        let mut layers = self.layers.lock().await;
        let zindex = zindex.unwrap_or(layers.len()).min(layers.len());

        if self.running() {
            holder.start(self.ready_tx.lock().clone());
        }
        layers.insert(zindex, holder);
        let became_first = layers.len() == 1;
        drop(layers);

        info!("Layer created, renderer={key} zindex={zindex}");
        self.layers_changed.fire(&LayersChangedEvent {
            action: "add",
            zindex,
            renderer_key: key,
        });

        if became_first && !self.running() {
            self.start();
        }
        Some(zindex)
    }

    async fn teardown_holder(&self, mut holder: LayerHolder, zindex: usize) {
        holder.stop().await;

        if let Some(device) = self.device.upgrade() {
            if let Some(frame) = device.frame_control() {
                holder.renderer.lock().await.finish(frame);
            }
        }

        let key = holder.key.clone();
        drop(holder);

        info!("Layer {zindex} removed");
        self.layers_changed.fire(&LayersChangedEvent {
            action: "remove",
            zindex,
            renderer_key: key,
        });
    }

    /// Remove the layer at a zindex: cancel its tasks, run the renderer's
    /// teardown, renumber the remainder. Removing the last layer stops
    /// the loop.
    pub async fn remove_layer(self: &Arc<Self>, zindex: usize) -> bool {
        let removed = {
            let mut layers = self.layers.lock().await;
            if zindex >= layers.len() {
                return false;
            }
            layers.remove(zindex)
        };

        self.teardown_holder(removed, zindex).await;

        if self.layer_count().await == 0 && self.running() {
            self.stop().await;
        }
        true
    }

    /// Remove all layers in reverse order.
    pub async fn clear_layers(self: &Arc<Self>) -> bool {
        let count = self.layer_count().await;
        if count == 0 {
            return false;
        }
        for zindex in (0..count).rev() {
            self.remove_layer(zindex).await;
        }
        true
    }

    /// Apply trait values to a running layer, firing `traits_changed` per
    /// field.
    pub async fn set_layer_traits(
        self: &Arc<Self>,
        zindex: usize,
        values: &TraitValues,
    ) -> Result<(), crate::traits::TraitError> {
        let layers = self.layers.lock().await;
        let Some(holder) = layers.get(zindex) else {
            return Err(crate::traits::TraitError::Unknown(format!(
                "no layer at zindex {zindex}"
            )));
        };

        let mut renderer = holder.renderer.lock().await;
        for (name, value) in values {
            let old = renderer.get_traits().get(name.as_str()).cloned();
            renderer.set_trait(name, value)?;
            self.traits_changed.fire(&TraitsChangedEvent {
                zindex,
                values: renderer.get_traits(),
                field: name.clone(),
                old,
            });
        }
        Ok(())
    }

    /// Start the loop; requires at least one configured layer.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Animation loop already running");
            return false;
        }

        self.error.store(false, Ordering::SeqCst);

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        *self.ready_tx.lock() = ready_tx;

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.animate(ready_rx).await;
        });
        *self.anim_task.lock() = Some(task);

        self.state_changed.fire(&"running".to_string());
        true
    }

    /// Stop the loop, tearing remaining layers down in reverse order.
    pub async fn stop(self: &Arc<Self>) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }

        loop {
            let popped = {
                let mut layers = self.layers.lock().await;
                let zindex = layers.len().wrapping_sub(1);
                layers.pop().map(|holder| (holder, zindex))
            };
            match popped {
                Some((holder, zindex)) => self.teardown_holder(holder, zindex).await,
                None => break,
            }
        }

        let task = self.anim_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        info!("AnimationLoop stopped");
        self.state_changed.fire(&"stopped".to_string());
        true
    }

    /// Gate the loop. Paused transitions fire a state event.
    pub fn pause(&self, paused: bool) {
        if *self.paused_tx.borrow() == paused {
            return;
        }
        debug!("Loop paused: {paused}");
        self.paused_tx.send_replace(paused);
        self.state_changed
            .fire(&(if paused { "paused" } else { "running" }).to_string());
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    async fn animate(self: Arc<Self>, mut ready_rx: mpsc::UnboundedReceiver<(u64, Layer)>) {
        info!("AnimationLoop is starting");

        {
            let ready_tx = self.ready_tx.lock().clone();
            let mut layers = self.layers.lock().await;
            for holder in layers.iter_mut() {
                holder.start(ready_tx.clone());
            }
        }

        let mut paused_rx = self.paused_tx.subscribe();
        let mut tick = Ticker::new(Duration::from_secs_f64(1.0 / MAX_FPS));

        while self.running() {
            // paused loops block here without spurious wakeups
            while *paused_rx.borrow() {
                if paused_rx.changed().await.is_err() {
                    break;
                }
            }

            let Some((id, buf)) = ready_rx.recv().await else {
                break;
            };
            if !self.running() {
                break;
            }

            self.deliver(id, buf).await;
            while let Ok((id, buf)) = ready_rx.try_recv() {
                self.deliver(id, buf).await;
            }

            if let Err(err) = self.commit_current().await {
                error!("Frame commit failed, stopping animation: {err}");
                self.error.store(true, Ordering::SeqCst);
                self.running.store(false, Ordering::SeqCst);
                break;
            }

            tick.tick().await;
        }

        if self.error.load(Ordering::SeqCst) {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.clear_layers().await;
            });
            self.state_changed.fire(&"stopped".to_string());
        }
    }

    /// Swap a freshly drawn buffer in as the holder's current frame and
    /// recycle the previous one.
    async fn deliver(&self, id: u64, buf: Layer) {
        let mut layers = self.layers.lock().await;
        if let Some(holder) = layers.iter_mut().find(|h| h.id == id) {
            if let Some(old) = holder.current_buf.replace(buf) {
                holder.free_buffer(old);
            }
        }
    }

    async fn commit_current(&self) -> Result<(), crate::device::DeviceError> {
        let Some(device) = self.device.upgrade() else {
            return Ok(());
        };
        let Some(frame) = device.frame_control() else {
            return Ok(());
        };

        let layers = self.layers.lock().await;
        let active: Vec<&Layer> = layers.iter().filter_map(|h| h.current_buf.as_ref()).collect();
        if active.is_empty() {
            return Ok(());
        }
        frame.commit(&active, None, true).await
    }

    /// Current layer snapshot for persistence: (renderer key, traits) in
    /// zindex order.
    pub async fn snapshot(&self) -> Vec<LayerPrefs> {
        let layers = self.layers.lock().await;
        let mut out = Vec::with_capacity(layers.len());
        for holder in layers.iter() {
            out.push(LayerPrefs {
                renderer: holder.key.clone(),
                traits: holder.trait_values().await,
            });
        }
        out
    }
}

/// Configures and manages animations for one device.
pub struct AnimationManager {
    device: Weak<ChromaDevice>,
    loop_: Mutex<Option<Arc<AnimationLoop>>>,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    pub layers_changed: Signal<LayersChangedEvent>,
    pub state_changed: Signal<String>,
}

impl AnimationManager {
    pub fn new(device: Weak<ChromaDevice>) -> Arc<Self> {
        let manager = Arc::new(Self {
            device: device.clone(),
            loop_: Mutex::new(None),
            paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            layers_changed: Signal::new(),
            state_changed: Signal::new(),
        });

        // mirror device suspend onto pause
        if let Some(dev) = device.upgrade() {
            let weak = Arc::downgrade(&manager);
            dev.power_state_changed.connect(move |(_, suspended)| {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let suspended = *suspended;
                if manager.running() && manager.is_paused() != suspended {
                    tokio::spawn(async move {
                        manager.pause(Some(suspended)).await;
                    });
                }
            });
        }

        manager
    }

    pub fn running(&self) -> bool {
        self.loop_
            .lock()
            .as_ref()
            .map(|l| l.running())
            .unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn get_or_create_loop(self: &Arc<Self>) -> Arc<AnimationLoop> {
        let mut slot = self.loop_.lock();
        if let Some(loop_) = slot.as_ref() {
            return Arc::clone(loop_);
        }

        let loop_ = AnimationLoop::new(self.device.clone());

        // relay layer events and persist the stack on every change
        let weak = Arc::downgrade(self);
        loop_.layers_changed.connect(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.layers_changed.fire(event);
                manager.spawn_update_prefs();
            }
        });

        let weak = Arc::downgrade(self);
        loop_.traits_changed.connect(move |_event: &TraitsChangedEvent| {
            if let Some(manager) = weak.upgrade() {
                manager.spawn_update_prefs();
            }
        });

        // the device schedules a reset when the loop stops
        let weak = Arc::downgrade(self);
        loop_.state_changed.connect(move |state: &String| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            manager.state_changed.fire(state);
            if state == "stopped" {
                if let Some(device) = manager.device.upgrade() {
                    tokio::spawn(async move {
                        if let Err(err) = device.reset().await {
                            warn!("Device reset after animation stop failed: {err}");
                        }
                    });
                }
            }
        });

        *slot = Some(Arc::clone(&loop_));
        loop_
    }

    /// Instantiate a registered renderer and add it as a layer.
    ///
    /// Returns the zindex, or None when the renderer is unknown, a trait
    /// value is invalid, or `init` refuses.
    pub async fn add_renderer(
        self: &Arc<Self>,
        key: &str,
        zindex: Option<usize>,
        values: &TraitValues,
    ) -> Option<usize> {
        let device = self.device.upgrade()?;
        let info = renderer::registry().get(key)?;

        let mut instance = (info.factory)(&device);
        if let Err(err) = apply_traits(instance.as_mut(), values) {
            error!("Renderer {key}: {err}");
            return None;
        }

        let loop_ = self.get_or_create_loop();
        loop_.add_layer(key.to_string(), instance, zindex).await
    }

    pub async fn remove_renderer(self: &Arc<Self>, zindex: usize) -> bool {
        let loop_ = self.loop_.lock().clone();
        match loop_ {
            Some(loop_) => loop_.remove_layer(zindex).await,
            None => false,
        }
    }

    pub async fn set_layer_traits(
        self: &Arc<Self>,
        zindex: usize,
        values: &TraitValues,
    ) -> Result<(), crate::traits::TraitError> {
        let loop_ = self.loop_.lock().clone();
        match loop_ {
            Some(loop_) => {
                loop_.set_layer_traits(zindex, values).await?;
                self.spawn_update_prefs();
                Ok(())
            }
            None => Err(crate::traits::TraitError::Unknown("no animation".into())),
        }
    }

    /// Pause or resume; None toggles.
    pub async fn pause(self: &Arc<Self>, state: Option<bool>) -> bool {
        let state = state.unwrap_or(!self.is_paused());
        let loop_ = self.loop_.lock().clone();
        if let Some(loop_) = loop_ {
            loop_.pause(state);
        }
        self.paused.store(state, Ordering::SeqCst);
        info!("Animation paused: {state}");
        state
    }

    pub async fn stop(self: &Arc<Self>) -> bool {
        let loop_ = self.loop_.lock().clone();
        match loop_ {
            Some(loop_) => loop_.stop().await,
            None => false,
        }
    }

    /// Drain all layers and wait for their tasks; used at device teardown.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let loop_ = self.loop_.lock().clone();
        if let Some(loop_) = loop_ {
            loop_.clear_layers().await;
            loop_.stop().await;
        }
    }

    /// Rebuild saved layers from preferences.
    pub async fn restore_prefs(self: &Arc<Self>, prefs: &Preferences) {
        if prefs.layers.is_empty() {
            return;
        }
        debug!("Restoring {} animation layers", prefs.layers.len());

        for layer in &prefs.layers {
            if self
                .add_renderer(&layer.renderer, None, &layer.traits)
                .await
                .is_none()
            {
                warn!("Failed to restore renderer {}, clearing", layer.renderer);
                self.stop().await;
                return;
            }
        }
    }

    /// Per-holder buffer totals (free + active + current); see
    /// [`AnimationLoop::buffer_accounting`].
    #[doc(hidden)]
    pub async fn buffer_accounting(&self) -> Vec<usize> {
        let loop_ = self.loop_.lock().clone();
        match loop_ {
            Some(loop_) => loop_.buffer_accounting().await,
            None => Vec::new(),
        }
    }

    fn spawn_update_prefs(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Some(device) = manager.device.upgrade() else {
                return;
            };
            let loop_ = manager.loop_.lock().clone();
            let Some(loop_) = loop_ else {
                return;
            };
            let snapshot = loop_.snapshot().await;
            device.preferences().await.update(|p| p.layers = snapshot);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn test_add_and_remove_layer() {
        let (device, _endpoint) = testing::keyboard_device();
        device.prime_serial("ANIM");
        let manager = device.animation_manager().unwrap();

        let zindex = manager
            .add_renderer("fxlib.solid", None, &TraitValues::new())
            .await
            .unwrap();
        assert_eq!(zindex, 0);
        assert!(manager.running());

        assert!(manager.remove_renderer(0).await);
        // removing the last layer stops the loop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.running());
    }

    #[tokio::test]
    async fn test_unknown_renderer_refused() {
        let (device, _) = testing::keyboard_device();
        device.prime_serial("ANIM");
        let manager = device.animation_manager().unwrap();
        assert!(manager
            .add_renderer("no.such.thing", None, &TraitValues::new())
            .await
            .is_none());
        assert!(!manager.running());
    }

    #[tokio::test]
    async fn test_invalid_trait_refused_before_start() {
        let (device, _) = testing::keyboard_device();
        device.prime_serial("ANIM");
        let manager = device.animation_manager().unwrap();

        let mut bad = TraitValues::new();
        bad.insert("fps".into(), TraitValue::Float(500.0));
        assert!(manager
            .add_renderer("fxlib.rainbow", None, &bad)
            .await
            .is_none());
        assert!(!manager.running());
    }

    #[tokio::test]
    async fn test_loop_commits_frames() {
        let (device, endpoint) = testing::keyboard_device();
        device.prime_serial("ANIM");
        let manager = device.animation_manager().unwrap();

        manager
            .add_renderer("fxlib.rainbow", None, &TraitValues::new())
            .await
            .unwrap();

        // give the loop a few real ticks
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.stop().await;

        let sent = endpoint.lock().sent.clone();
        // frame rows went out: SET_FRAME_DATA_MATRIX is class 0x03 id 0x0B
        assert!(
            sent.iter().any(|buf| buf[6] == 0x03 && buf[7] == 0x0B),
            "no frame data was committed"
        );
    }

    #[tokio::test]
    async fn test_pause_resumes() {
        let (device, _) = testing::keyboard_device();
        device.prime_serial("ANIM");
        let manager = device.animation_manager().unwrap();

        manager
            .add_renderer("fxlib.rainbow", None, &TraitValues::new())
            .await
            .unwrap();

        assert!(manager.pause(None).await);
        assert!(manager.is_paused());
        assert!(!manager.pause(None).await);
        assert!(!manager.is_paused());

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_zindex_ordering_on_insert() {
        let (device, _) = testing::keyboard_device();
        device.prime_serial("ANIM");
        let manager = device.animation_manager().unwrap();

        manager
            .add_renderer("fxlib.solid", None, &TraitValues::new())
            .await
            .unwrap();
        let z = manager
            .add_renderer("fxlib.rainbow", Some(0), &TraitValues::new())
            .await
            .unwrap();
        assert_eq!(z, 0);

        let loop_ = manager.loop_.lock().clone().unwrap();
        let snapshot = loop_.snapshot().await;
        assert_eq!(snapshot[0].renderer, "fxlib.rainbow");
        assert_eq!(snapshot[1].renderer, "fxlib.solid");

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_traits_changed_fires() {
        let (device, _) = testing::keyboard_device();
        device.prime_serial("ANIM");
        let manager = device.animation_manager().unwrap();

        manager
            .add_renderer("fxlib.rainbow", None, &TraitValues::new())
            .await
            .unwrap();

        let loop_ = manager.loop_.lock().clone().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        loop_.traits_changed.connect(move |event: &TraitsChangedEvent| {
            sink.lock().push((event.zindex, event.field.clone()));
        });

        let mut values = TraitValues::new();
        values.insert("speed".into(), TraitValue::Float(3.0));
        manager.set_layer_traits(0, &values).await.unwrap();

        assert_eq!(&*seen.lock(), &[(0, "speed".to_string())]);
        manager.stop().await;
    }
}
