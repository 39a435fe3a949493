//! Mock Microscope
//!
//! A complete in-memory diSPIM for tests and the `simulate` command. One
//! [`MockMicroscope`] implements every capability trait; wrap it in an `Arc` and
//! call [`MockMicroscope::microscope`] to get the [`Microscope`] bundle.
//!
//! # Behaviour
//!
//! - Two cameras ("HamCam1" on path A, "HamCam2" on path B) with a 64x64 ROI
//! - Edge-mode reset 10.1 ms, readout 10 ms; no readout in overlap mode
//! - Triggering the controller delivers the programmed number of frames for
//!   every armed camera straight into the shared frame buffer
//! - Every state-changing call is recorded by name, in order; reads are only
//!   counted
//!
//! # Failure Injection
//!
//! [`MockMicroscope::fail_on`] makes the named operation return an error (after
//! it is recorded), e.g. `fail_on("program")` to fail mid-arming.

use crate::acquisition::modes::{CameraMode, Side, SpimMode};
use crate::acquisition::program::ControllerProgram;
use crate::hardware::capabilities::{
    props, Autofocus, CameraBank, ChannelControl, Frame, FrameCoords, ImageSink, LiveMode,
    Microscope, PositionStore, PropertyStore, Roi, SpimController,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, RwLock};
use tokio::time::{Duration, Instant};

/// Camera on imaging path A.
pub const CAMERA_A: &str = "HamCam1";
/// Camera on imaging path B.
pub const CAMERA_B: &str = "HamCam2";
/// Camera used for live view before any acquisition.
pub const BOTTOM_CAMERA: &str = "Bottom";

const MOCK_READOUT_MS: f64 = 10.0;
const MOCK_RESET_MS: f64 = 10.1;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct CameraState {
    trigger_mode: Option<CameraMode>,
    exposure_ms: f64,
    /// Frames still to deliver in the current sequence
    remaining: u64,
    next_sequence: u64,
}

/// One image as handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    /// Dataset open when the image arrived
    pub dataset: String,
    /// Source camera
    pub camera: String,
    /// Routed coordinates
    pub coords: FrameCoords,
}

/// In-memory diSPIM.
#[derive(Debug)]
pub struct MockMicroscope {
    camera_a: Option<String>,
    camera_b: Option<String>,
    rois: HashMap<String, Roi>,
    cameras: RwLock<HashMap<String, CameraState>>,
    current_camera: RwLock<String>,

    buffer: Mutex<VecDeque<Frame>>,
    frame_ready: Notify,
    /// Stop delivering after this many frames in total
    frame_limit: Mutex<Option<u64>>,
    frames_delivered: AtomicU64,

    program: RwLock<Option<ControllerProgram>>,
    triggers: AtomicU64,

    properties: Mutex<HashMap<(String, String), f64>>,
    stage_scan_capable: bool,

    positions: Vec<(f64, f64)>,
    xy: Mutex<(f64, f64)>,
    polling_paused: AtomicBool,

    live: AtomicBool,

    channel_configs: Vec<String>,
    current_channel: Mutex<HashMap<String, String>>,

    datasets: Mutex<Vec<String>>,
    images: Mutex<Vec<StoredImage>>,
    dataset_open: AtomicBool,

    calls: Mutex<Vec<String>>,
    reads: AtomicU64,
    failures: Mutex<HashSet<String>>,
}

impl Default for MockMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMicroscope {
    /// Two cameras, live view on, four channel presets, stage-scan capable.
    pub fn new() -> Self {
        let roi = Roi {
            x: 0,
            y: 0,
            width: 64,
            height: 64,
        };
        let mut properties = HashMap::new();
        for scanner in [props::SCANNER_A, props::SCANNER_B] {
            properties.insert((scanner.to_string(), props::FILTER_FREQ_X.to_string()), 1.6);
        }
        properties.insert(
            (props::XY_STAGE.to_string(), props::ACCELERATION_X.to_string()),
            50.0,
        );
        properties.insert(
            (props::XY_STAGE.to_string(), props::STAGESCAN_MOTOR_SPEED.to_string()),
            1.0,
        );

        Self {
            camera_a: Some(CAMERA_A.to_string()),
            camera_b: Some(CAMERA_B.to_string()),
            rois: HashMap::from([
                (CAMERA_A.to_string(), roi),
                (CAMERA_B.to_string(), roi),
                (BOTTOM_CAMERA.to_string(), roi),
            ]),
            cameras: RwLock::new(HashMap::new()),
            current_camera: RwLock::new(BOTTOM_CAMERA.to_string()),
            buffer: Mutex::new(VecDeque::new()),
            frame_ready: Notify::new(),
            frame_limit: Mutex::new(None),
            frames_delivered: AtomicU64::new(0),
            program: RwLock::new(None),
            triggers: AtomicU64::new(0),
            properties: Mutex::new(properties),
            stage_scan_capable: true,
            positions: Vec::new(),
            xy: Mutex::new((0.0, 0.0)),
            polling_paused: AtomicBool::new(false),
            live: AtomicBool::new(true),
            channel_configs: ["488nm", "561nm", "640nm", "405nm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            current_channel: Mutex::new(HashMap::new()),
            datasets: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
            dataset_open: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
            failures: Mutex::new(HashSet::new()),
        }
    }

    /// Leave an imaging path without a camera.
    pub fn without_camera(mut self, side: Side) -> Self {
        match side {
            Side::A => self.camera_a = None,
            Side::B => self.camera_b = None,
        }
        self
    }

    /// Give a camera a different ROI.
    pub fn with_roi(mut self, side: Side, roi: Roi) -> Self {
        let camera = match side {
            Side::A => CAMERA_A,
            Side::B => CAMERA_B,
        };
        self.rois.insert(camera.to_string(), roi);
        self
    }

    /// Populate the position list.
    pub fn with_positions(mut self, positions: Vec<(f64, f64)>) -> Self {
        self.positions = positions;
        self
    }

    /// Report a stage without scan firmware.
    pub fn without_stage_scan(mut self) -> Self {
        self.stage_scan_capable = false;
        self
    }

    /// Start with live view on or off.
    pub fn with_live(self, on: bool) -> Self {
        self.live.store(on, Ordering::SeqCst);
        self
    }

    /// Bundle this mock as every collaborator.
    pub fn microscope(self: &Arc<Self>) -> Microscope {
        Microscope {
            controller: self.clone(),
            cameras: self.clone(),
            props: self.clone(),
            positions: self.clone(),
            live: self.clone(),
            channels: self.clone(),
            sink: self.clone(),
            autofocus: self.clone(),
        }
    }

    // =========================================================================
    // Failure injection and inspection
    // =========================================================================

    /// Make `operation` fail from now on.
    pub fn fail_on(&self, operation: &str) {
        lock(&self.failures).insert(operation.to_string());
    }

    /// Deliver at most `n` more frames in total.
    pub fn limit_frames(&self, n: u64) {
        *lock(&self.frame_limit) = Some(self.frames_delivered.load(Ordering::SeqCst) + n);
    }

    /// Names of every state-changing call, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of state-changing calls so far.
    pub fn mutation_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Number of device reads so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of controller triggers so far.
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }

    /// Position polling is paused.
    pub fn polling_paused(&self) -> bool {
        self.polling_paused.load(Ordering::SeqCst)
    }

    /// Camera currently selected.
    pub async fn selected_camera(&self) -> String {
        self.current_camera.read().await.clone()
    }

    /// Program most recently sent to the controller.
    pub async fn last_program(&self) -> Option<ControllerProgram> {
        self.program.read().await.clone()
    }

    /// Trigger mode of a camera; `None` is internal.
    pub async fn trigger_mode(&self, camera: &str) -> Option<CameraMode> {
        self.cameras
            .read()
            .await
            .get(camera)
            .and_then(|c| c.trigger_mode)
    }

    /// Exposure last set on a camera.
    pub async fn exposure_ms(&self, camera: &str) -> Option<f64> {
        self.cameras.read().await.get(camera).map(|c| c.exposure_ms)
    }

    /// Preset currently applied in `group`.
    pub fn channel(&self, group: &str) -> Option<String> {
        lock(&self.current_channel).get(group).cloned()
    }

    /// Datasets opened, in order.
    pub fn datasets(&self) -> Vec<String> {
        lock(&self.datasets).clone()
    }

    /// Every stored image.
    pub fn images(&self) -> Vec<StoredImage> {
        lock(&self.images).clone()
    }

    /// Current XY stage position.
    pub fn xy_position(&self) -> (f64, f64) {
        *lock(&self.xy)
    }

    fn record(&self, call: impl Into<String>) -> Result<()> {
        let call = call.into();
        let op = call.split(':').next().unwrap_or_default().to_string();
        lock(&self.calls).push(call.clone());
        if lock(&self.failures).contains(&op) {
            return Err(anyhow!("MockMicroscope: injected failure in {call}"));
        }
        Ok(())
    }

    fn read(&self, op: &str) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failures).contains(op) {
            return Err(anyhow!("MockMicroscope: injected failure in {op}"));
        }
        Ok(())
    }

    fn camera_name(&self, side: Side) -> Option<&String> {
        match side {
            Side::A => self.camera_a.as_ref(),
            Side::B => self.camera_b.as_ref(),
        }
    }

    /// Frames one trigger produces on the camera of `side`.
    fn frames_per_trigger(program: &ControllerProgram, side: Side, mode: Option<CameraMode>) -> u64 {
        let Some(side_program) = program.sides.iter().find(|p| p.side == side) else {
            return 0;
        };
        let extra = u32::from(mode == Some(CameraMode::Overlap));
        u64::from(side_program.num_slices.saturating_sub(extra))
            * u64::from(side_program.slices_per_piezo)
            * u64::from(side_program.num_repeats)
    }

    async fn deliver_frames(&self) {
        let Some(program) = self.program.read().await.clone() else {
            return;
        };
        let limit = *lock(&self.frame_limit);
        let mut cameras = self.cameras.write().await;
        let mut produced = Vec::new();
        for side in [Side::A, Side::B] {
            let Some(name) = self.camera_name(side) else {
                continue;
            };
            let Some(state) = cameras.get_mut(name) else {
                continue;
            };
            let n = Self::frames_per_trigger(&program, side, state.trigger_mode)
                .min(state.remaining);
            let roi = self.rois.get(name).copied().unwrap_or_default();
            for _ in 0..n {
                let seq = state.next_sequence;
                state.next_sequence += 1;
                state.remaining -= 1;
                produced.push(Frame {
                    camera: name.clone(),
                    sequence: seq,
                    width: roi.width,
                    height: roi.height,
                    pixels: (0..roi.width * roi.height)
                        .map(|i| ((i as u64 + seq) % 4096) as u16)
                        .collect(),
                });
            }
        }
        drop(cameras);

        let mut buffer = lock(&self.buffer);
        for frame in produced {
            let delivered = self.frames_delivered.load(Ordering::SeqCst);
            if limit.is_some_and(|l| delivered >= l) {
                break;
            }
            self.frames_delivered.fetch_add(1, Ordering::SeqCst);
            buffer.push_back(frame);
            self.frame_ready.notify_one();
        }
    }
}

// =============================================================================
// Capability implementations
// =============================================================================

#[async_trait]
impl SpimController for MockMicroscope {
    async fn program(&self, program: &ControllerProgram) -> Result<()> {
        self.record("program")?;
        *self.program.write().await = Some(program.clone());
        Ok(())
    }

    async fn trigger(&self, mode: SpimMode, first_side: Side) -> Result<()> {
        let via = if mode.is_stage_scan() {
            "stage".to_string()
        } else {
            format!("scanner_{}", first_side.letter())
        };
        self.record(format!("trigger:{via}"))?;
        self.triggers.fetch_add(1, Ordering::SeqCst);
        self.deliver_frames().await;
        Ok(())
    }

    async fn clean_up(&self, sides: &[Side]) -> Result<()> {
        let sides: String = sides.iter().map(|s| s.letter()).collect();
        self.record(format!("clean_up:{sides}"))
    }
}

#[async_trait]
impl CameraBank for MockMicroscope {
    fn camera_for(&self, side: Side) -> Option<String> {
        self.camera_name(side).cloned()
    }

    async fn current_camera(&self) -> Result<String> {
        self.read("current_camera")?;
        Ok(self.current_camera.read().await.clone())
    }

    async fn set_current_camera(&self, camera: &str) -> Result<()> {
        self.record(format!("set_current_camera:{camera}"))?;
        *self.current_camera.write().await = camera.to_string();
        Ok(())
    }

    async fn roi(&self, camera: &str) -> Result<Roi> {
        self.read("roi")?;
        self.rois
            .get(camera)
            .copied()
            .ok_or_else(|| anyhow!("MockMicroscope: unknown camera {camera}"))
    }

    async fn reset_time_ms(&self, _camera: &str, mode: CameraMode) -> Result<f64> {
        self.read("reset_time_ms")?;
        Ok(match mode {
            CameraMode::Edge | CameraMode::Level => MOCK_RESET_MS,
            CameraMode::Overlap | CameraMode::PseudoOverlap => MOCK_RESET_MS - MOCK_READOUT_MS,
        })
    }

    async fn readout_time_ms(&self, _camera: &str, overlap: bool) -> Result<f64> {
        self.read("readout_time_ms")?;
        Ok(if overlap { 0.0 } else { MOCK_READOUT_MS })
    }

    async fn set_trigger_mode(&self, cameras: &[String], mode: Option<CameraMode>) -> Result<()> {
        let label = mode.map_or_else(|| "internal".to_string(), |m| m.to_string());
        self.record(format!("set_trigger_mode:{label}"))?;
        let mut states = self.cameras.write().await;
        for camera in cameras {
            states.entry(camera.clone()).or_default().trigger_mode = mode;
        }
        Ok(())
    }

    async fn set_exposure(&self, camera: &str, exposure_ms: f64) -> Result<()> {
        self.record(format!("set_exposure:{camera}"))?;
        if exposure_ms <= 0.0 {
            anyhow::bail!("MockMicroscope: exposure must be positive");
        }
        self.cameras
            .write()
            .await
            .entry(camera.to_string())
            .or_default()
            .exposure_ms = exposure_ms;
        Ok(())
    }

    async fn clear_buffer(&self) -> Result<()> {
        self.record("clear_buffer")?;
        lock(&self.buffer).clear();
        Ok(())
    }

    async fn start_sequence(&self, camera: &str, num_frames: u64) -> Result<()> {
        self.record(format!("start_sequence:{camera}"))?;
        let mut states = self.cameras.write().await;
        let state = states.entry(camera.to_string()).or_default();
        state.remaining = num_frames;
        state.next_sequence = 0;
        Ok(())
    }

    async fn stop_sequence(&self, camera: &str) -> Result<()> {
        self.record(format!("stop_sequence:{camera}"))?;
        if let Some(state) = self.cameras.write().await.get_mut(camera) {
            state.remaining = 0;
        }
        Ok(())
    }

    async fn next_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.read("next_frame")?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = lock(&self.buffer).pop_front() {
                return Ok(Some(frame));
            }
            if tokio::time::timeout_at(deadline, self.frame_ready.notified())
                .await
                .is_err()
            {
                return Ok(lock(&self.buffer).pop_front());
            }
        }
    }
}

#[async_trait]
impl PropertyStore for MockMicroscope {
    async fn get_float(&self, device: &str, property: &str) -> Result<f64> {
        self.read("get_float")?;
        lock(&self.properties)
            .get(&(device.to_string(), property.to_string()))
            .copied()
            .ok_or_else(|| anyhow!("MockMicroscope: no property {device}.{property}"))
    }

    async fn set_float(&self, device: &str, property: &str, value: f64) -> Result<()> {
        self.record(format!("set_float:{device}.{property}"))?;
        lock(&self.properties).insert((device.to_string(), property.to_string()), value);
        Ok(())
    }

    fn has_property(&self, device: &str, property: &str) -> bool {
        if device == props::XY_STAGE && property == props::STAGESCAN_NUM_LINES {
            return self.stage_scan_capable;
        }
        lock(&self.properties).contains_key(&(device.to_string(), property.to_string()))
    }
}

#[async_trait]
impl PositionStore for MockMicroscope {
    async fn position_count(&self) -> Result<usize> {
        self.read("position_count")?;
        Ok(self.positions.len())
    }

    async fn go_to(&self, index: usize) -> Result<()> {
        self.record(format!("go_to:{index}"))?;
        let target = self
            .positions
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("MockMicroscope: no position {index}"))?;
        *lock(&self.xy) = target;
        Ok(())
    }

    async fn xy(&self) -> Result<(f64, f64)> {
        self.read("xy")?;
        Ok(*lock(&self.xy))
    }

    async fn set_xy(&self, x_um: f64, y_um: f64) -> Result<()> {
        self.record("set_xy")?;
        *lock(&self.xy) = (x_um, y_um);
        Ok(())
    }

    fn pause_updates(&self, paused: bool) {
        let _ = self.record(format!("pause_updates:{paused}"));
        self.polling_paused.store(paused, Ordering::SeqCst);
    }
}

#[async_trait]
impl LiveMode for MockMicroscope {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn set_live(&self, on: bool) -> Result<()> {
        self.record(format!("set_live:{on}"))?;
        self.live.store(on, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ChannelControl for MockMicroscope {
    async fn current_config(&self, group: &str) -> Result<String> {
        self.read("current_config")?;
        Ok(lock(&self.current_channel)
            .get(group)
            .cloned()
            .or_else(|| self.channel_configs.first().cloned())
            .unwrap_or_default())
    }

    async fn set_config(&self, group: &str, config: &str) -> Result<()> {
        self.record(format!("set_config:{config}"))?;
        if !self.channel_configs.iter().any(|c| c == config) {
            anyhow::bail!("MockMicroscope: unknown channel preset {config}");
        }
        lock(&self.current_channel).insert(group.to_string(), config.to_string());
        Ok(())
    }

    async fn available_configs(&self, _group: &str) -> Result<Vec<String>> {
        self.read("available_configs")?;
        Ok(self.channel_configs.clone())
    }
}

#[async_trait]
impl ImageSink for MockMicroscope {
    async fn begin(&self, name: &str) -> Result<()> {
        self.record(format!("begin:{name}"))?;
        lock(&self.datasets).push(name.to_string());
        self.dataset_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, frame: Frame, coords: FrameCoords) -> Result<()> {
        self.read("put")?;
        if !self.dataset_open.load(Ordering::SeqCst) {
            anyhow::bail!("MockMicroscope: no open dataset");
        }
        let dataset = lock(&self.datasets).last().cloned().unwrap_or_default();
        lock(&self.images).push(StoredImage {
            dataset,
            camera: frame.camera,
            coords,
        });
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.record("finish")?;
        self.dataset_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Autofocus for MockMicroscope {
    async fn run_focus(&self, side: Side) -> Result<f64> {
        self.record(format!("autofocus:{}", side.letter()))?;
        Ok(0.9)
    }
}
