// SPDX-License-Identifier: CEPL-1.0
//! Session/frame state machine.
//!
//! Runtime session-state notifications are mapped onto two behaviours:
//! begin the session when the runtime is ready for frames, end it when the
//! runtime stops or goes away. Each application tick calls
//! [`FrameLoop::begin_frame`] and, unless that returned
//! [`FrameOutcome::SkipFully`], exactly one [`FrameLoop::end_frame`].
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use stereo_math::{projection_from_fov, Mat4, Pose, PoseValidity};
use tracing::{debug, error, info, warn};

use crate::runtime::{EyeRenderInfo, FrameTiming, LocatedView, RuntimeEvent, SessionState, XrRuntime};
use crate::RenderSize;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameLoopConfig {
    pub near_clip: f32,
    pub far_clip: f32,
    /// Upper bound for waiting on an acquired swapchain image.
    pub acquire_timeout: Duration,
}

impl Default for FrameLoopConfig {
    fn default() -> Self {
        Self {
            near_clip: 0.01,
            far_clip: 100.0,
            acquire_timeout: Duration::from_secs(1),
        }
    }
}

/// How the caller should treat this tick. `Err` from `begin_frame` is the
/// fourth outcome: terminate the render loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Record and submit against `image_index`, then call `end_frame`.
    RenderFully { image_index: u32 },
    /// Submit nothing, but still call `end_frame`.
    SkipRender,
    /// Do nothing this tick, not even `end_frame`.
    SkipFully,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Eye {
    pub resolution: RenderSize,
    pub view: Mat4,
    pub projection: Mat4,
    pub render_info: EyeRenderInfo,
}

impl Eye {
    fn new(resolution: RenderSize, array_index: u32) -> Self {
        Self {
            resolution,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            render_info: EyeRenderInfo {
                pose: Pose::IDENTITY,
                fov: stereo_math::Fov::symmetric(0.0, 0.0),
                extent: resolution,
                array_index,
            },
        }
    }
}

/// State captured by `begin_frame` and consumed by the matching `end_frame`.
#[derive(Clone, Copy, Debug)]
struct PendingFrame {
    timing: FrameTiming,
    image_acquired: bool,
}

pub struct FrameLoop<R: XrRuntime> {
    runtime: R,
    config: FrameLoopConfig,

    state: SessionState,
    session_running: bool,
    exit_requested: bool,

    eyes: Vec<Eye>,
    last_known: Vec<Pose>,
    tracking_degraded: bool,
    begin_failed: bool,

    pending: Option<PendingFrame>,
}

impl<R: XrRuntime> FrameLoop<R> {
    pub fn new(runtime: R, config: FrameLoopConfig) -> Self {
        let eyes: Vec<Eye> = runtime
            .eye_resolutions()
            .into_iter()
            .enumerate()
            .map(|(i, res)| Eye::new(res, i as u32))
            .collect();
        let last_known = vec![Pose::IDENTITY; eyes.len()];
        Self {
            runtime,
            config,
            state: SessionState::Unknown,
            session_running: false,
            exit_requested: false,
            eyes,
            last_known,
            tracking_degraded: false,
            begin_failed: false,
            pending: None,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn config(&self) -> &FrameLoopConfig {
        &self.config
    }

    pub fn session_state(&self) -> SessionState {
        self.state
    }

    pub fn is_session_running(&self) -> bool {
        self.session_running
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn eye_count(&self) -> usize {
        self.eyes.len()
    }

    pub fn eye(&self, index: usize) -> &Eye {
        &self.eyes[index]
    }

    pub fn eye_resolution(&self, index: usize) -> RenderSize {
        self.eyes[index].resolution
    }

    pub fn eye_view_matrix(&self, index: usize) -> Mat4 {
        self.eyes[index].view
    }

    pub fn eye_projection_matrix(&self, index: usize) -> Mat4 {
        self.eyes[index].projection
    }

    pub fn begin_frame(&mut self) -> Result<FrameOutcome> {
        self.poll_events();

        // The runtime sends no second `Ready`, so a failed begin is retried
        // here until it sticks.
        if !self.session_running && self.state.can_frame_sync() {
            self.begin_session();
        }

        if !self.session_running || !self.state.can_frame_sync() {
            return Ok(FrameOutcome::SkipFully);
        }

        let timing = self.runtime.wait_frame().context("wait_frame")?;
        self.runtime.begin_frame().context("begin_frame")?;
        self.pending = Some(PendingFrame {
            timing,
            image_acquired: false,
        });

        if !timing.should_render {
            return Ok(FrameOutcome::SkipRender);
        }

        let views = self
            .runtime
            .locate_views(timing.predicted_display_time)
            .context("locate_views")?;
        if views.len() != self.eyes.len() {
            return Err(anyhow!(
                "runtime located {} views for {} eyes",
                views.len(),
                self.eyes.len()
            ));
        }

        let image_index = self
            .runtime
            .acquire_image(self.config.acquire_timeout)
            .context("acquire swapchain image")?;
        if let Some(p) = self.pending.as_mut() {
            p.image_acquired = true;
        }

        self.update_eyes(&views);

        Ok(FrameOutcome::RenderFully { image_index })
    }

    /// Hands the acquired image back and submits the frame with the timing
    /// and eye data captured by the matching `begin_frame`.
    pub fn end_frame(&mut self) -> Result<()> {
        let Some(frame) = self.pending.take() else {
            debug!("end_frame without a frame in flight");
            return Ok(());
        };

        let mut released = Ok(());
        if frame.image_acquired {
            released = self.runtime.release_image().context("release swapchain image");
        }

        let infos: Vec<EyeRenderInfo> = if frame.timing.should_render && frame.image_acquired {
            self.eyes.iter().map(|e| e.render_info).collect()
        } else {
            Vec::new()
        };

        self.runtime
            .end_frame(frame.timing.predicted_display_time, &infos)
            .context("end_frame")?;
        released
    }

    fn poll_events(&mut self) {
        loop {
            match self.runtime.poll_event() {
                Ok(Some(RuntimeEvent::SessionStateChanged(state))) => {
                    self.handle_state_change(state);
                }
                Ok(Some(RuntimeEvent::InstanceLossPending)) => {
                    warn!("xr: instance loss pending");
                    self.exit_requested = true;
                }
                Ok(Some(RuntimeEvent::Other)) => {}
                Ok(None) => break,
                Err(e) => {
                    error!("xr: poll_event failed: {e:#}");
                    break;
                }
            }
        }
    }

    fn handle_state_change(&mut self, new_state: SessionState) {
        let old = self.state;
        self.state = new_state;
        info!("xr: session state {} -> {}", old.as_str(), new_state.as_str());

        match new_state {
            SessionState::Ready
            | SessionState::Synchronized
            | SessionState::Visible
            | SessionState::Focused => {
                if !self.session_running {
                    self.begin_session();
                }
            }
            SessionState::Idle | SessionState::Stopping => {
                if self.session_running {
                    self.end_session();
                }
            }
            SessionState::Exiting | SessionState::LossPending => {
                if self.session_running {
                    self.end_session();
                }
                self.exit_requested = true;
            }
            SessionState::Unknown => {}
        }
    }

    fn begin_session(&mut self) {
        match self.runtime.begin_session() {
            Ok(()) => {
                self.session_running = true;
                self.begin_failed = false;
                info!("xr: session begun");
            }
            Err(e) if self.begin_failed => debug!("xr: begin session retry failed: {e:#}"),
            Err(e) => {
                self.begin_failed = true;
                error!("xr: begin session failed, retrying every frame: {e:#}");
            }
        }
    }

    fn end_session(&mut self) {
        // The session counts as stopped either way; the runtime will not
        // accept frames for it any more.
        self.session_running = false;
        match self.runtime.end_session() {
            Ok(()) => info!("xr: session ended"),
            Err(e) => error!("xr: end session failed: {e:#}"),
        }
    }

    fn update_eyes(&mut self, views: &[LocatedView]) {
        let mut degraded = false;
        for (i, view) in views.iter().enumerate() {
            if view.validity != PoseValidity::all() {
                degraded = true;
            }
            let pose = view.pose.or_fallback(view.validity, self.last_known[i]);
            self.last_known[i] = pose;

            let eye = &mut self.eyes[i];
            eye.view = pose.view_matrix();
            eye.projection =
                projection_from_fov(view.fov, self.config.near_clip, self.config.far_clip);
            eye.render_info.pose = pose;
            eye.render_info.fov = view.fov;
        }

        if degraded != self.tracking_degraded {
            if degraded {
                warn!("xr: tracking degraded, holding last known eye poses");
            } else {
                info!("xr: tracking restored");
            }
            self.tracking_degraded = degraded;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use stereo_math::{Fov, Quat, Vec3};

    #[derive(Default)]
    struct ScriptedRuntime {
        eyes: usize,
        events: VecDeque<Result<RuntimeEvent>>,
        should_render: bool,
        views: Vec<LocatedView>,
        fail_wait: bool,
        fail_acquire: bool,
        fail_begin_session: bool,
        next_image: u32,
        calls: Vec<&'static str>,
        submitted: Vec<(i64, Vec<EyeRenderInfo>)>,
        display_time: i64,
    }

    impl ScriptedRuntime {
        fn stereo() -> Self {
            let fov = Fov::symmetric(0.8, 0.8);
            Self {
                eyes: 2,
                should_render: true,
                views: vec![
                    LocatedView {
                        pose: Pose {
                            orientation: Quat::IDENTITY,
                            position: Vec3::new(-0.032, 1.6, 0.0),
                        },
                        fov,
                        validity: PoseValidity::all(),
                    },
                    LocatedView {
                        pose: Pose {
                            orientation: Quat::IDENTITY,
                            position: Vec3::new(0.032, 1.6, 0.0),
                        },
                        fov,
                        validity: PoseValidity::all(),
                    },
                ],
                ..Default::default()
            }
        }

        fn push_state(&mut self, state: SessionState) {
            self.events
                .push_back(Ok(RuntimeEvent::SessionStateChanged(state)));
        }

        fn count(&self, call: &str) -> usize {
            self.calls.iter().filter(|c| **c == call).count()
        }
    }

    impl XrRuntime for ScriptedRuntime {
        fn eye_resolutions(&self) -> Vec<RenderSize> {
            vec![
                RenderSize {
                    width: 1440,
                    height: 1600
                };
                self.eyes
            ]
        }

        fn poll_event(&mut self) -> Result<Option<RuntimeEvent>> {
            self.events.pop_front().transpose()
        }

        fn begin_session(&mut self) -> Result<()> {
            self.calls.push("begin_session");
            if self.fail_begin_session {
                return Err(anyhow!("session busy"));
            }
            Ok(())
        }

        fn end_session(&mut self) -> Result<()> {
            self.calls.push("end_session");
            Ok(())
        }

        fn wait_frame(&mut self) -> Result<FrameTiming> {
            self.calls.push("wait_frame");
            if self.fail_wait {
                return Err(anyhow!("wait failed"));
            }
            self.display_time += 11_111_111;
            Ok(FrameTiming {
                predicted_display_time: self.display_time,
                predicted_display_period: 11_111_111,
                should_render: self.should_render,
            })
        }

        fn begin_frame(&mut self) -> Result<()> {
            self.calls.push("begin_frame");
            Ok(())
        }

        fn locate_views(&mut self, _display_time: i64) -> Result<Vec<LocatedView>> {
            self.calls.push("locate_views");
            Ok(self.views.clone())
        }

        fn acquire_image(&mut self, _timeout: Duration) -> Result<u32> {
            self.calls.push("acquire_image");
            if self.fail_acquire {
                return Err(anyhow!("timed out"));
            }
            let i = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok(i)
        }

        fn release_image(&mut self) -> Result<()> {
            self.calls.push("release_image");
            Ok(())
        }

        fn end_frame(&mut self, display_time: i64, views: &[EyeRenderInfo]) -> Result<()> {
            self.calls.push("end_frame");
            self.submitted.push((display_time, views.to_vec()));
            Ok(())
        }
    }

    fn running(runtime: ScriptedRuntime) -> FrameLoop<ScriptedRuntime> {
        let mut runtime = runtime;
        runtime.push_state(SessionState::Idle);
        runtime.push_state(SessionState::Ready);
        FrameLoop::new(runtime, FrameLoopConfig::default())
    }

    #[test]
    fn skips_fully_without_a_session() {
        let mut frames = FrameLoop::new(ScriptedRuntime::stereo(), FrameLoopConfig::default());
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert!(frames.runtime().calls.is_empty());
    }

    #[test]
    fn skips_fully_while_idle() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.push_state(SessionState::Idle);
        let mut frames = FrameLoop::new(runtime, FrameLoopConfig::default());
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert_eq!(frames.runtime().count("acquire_image"), 0);
        assert_eq!(frames.runtime().count("wait_frame"), 0);
    }

    #[test]
    fn ready_begins_session_and_renders() {
        let mut frames = running(ScriptedRuntime::stereo());
        let outcome = frames.begin_frame().unwrap();
        assert_eq!(outcome, FrameOutcome::RenderFully { image_index: 0 });
        assert!(frames.is_session_running());
        assert_eq!(frames.session_state(), SessionState::Ready);

        frames.end_frame().unwrap();
        let rt = frames.runtime();
        assert_eq!(
            rt.calls,
            [
                "begin_session",
                "wait_frame",
                "begin_frame",
                "locate_views",
                "acquire_image",
                "release_image",
                "end_frame"
            ]
        );
        let (time, layers) = &rt.submitted[0];
        assert_eq!(*time, 11_111_111);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].array_index, 1);
        assert_eq!(layers[0].extent.width, 1440);
    }

    #[test]
    fn consecutive_frames_cycle_images() {
        let mut frames = running(ScriptedRuntime::stereo());
        let mut seen = Vec::new();
        for _ in 0..4 {
            if let FrameOutcome::RenderFully { image_index } = frames.begin_frame().unwrap() {
                seen.push(image_index);
            }
            frames.end_frame().unwrap();
        }
        assert_eq!(seen, [0, 1, 2, 0]);
        assert_eq!(frames.runtime().count("end_frame"), 4);
    }

    #[test]
    fn skip_render_still_pairs_end_frame() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.should_render = false;
        let mut frames = running(runtime);

        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipRender);
        frames.end_frame().unwrap();

        let rt = frames.runtime();
        assert_eq!(rt.count("acquire_image"), 0);
        assert_eq!(rt.count("locate_views"), 0);
        assert_eq!(rt.count("release_image"), 0);
        assert_eq!(rt.count("end_frame"), 1);
        assert!(rt.submitted[0].1.is_empty());
    }

    #[test]
    fn end_frame_reuses_captured_display_time() {
        let mut frames = running(ScriptedRuntime::stereo());
        frames.begin_frame().unwrap();
        // The runtime clock moving on must not leak into this frame.
        frames.runtime_mut().display_time += 1_000;
        frames.end_frame().unwrap();
        assert_eq!(frames.runtime().submitted[0].0, 11_111_111);
    }

    #[test]
    fn eye_matrices_follow_located_poses() {
        let mut frames = running(ScriptedRuntime::stereo());
        frames.begin_frame().unwrap();

        assert_eq!(frames.eye_count(), 2);
        let left = frames.eye_view_matrix(0).transform_point3(Vec3::new(-0.032, 1.6, 0.0));
        assert!(left.abs_diff_eq(Vec3::ZERO, 1e-6));
        let expected = projection_from_fov(Fov::symmetric(0.8, 0.8), 0.01, 100.0);
        assert!(frames.eye_projection_matrix(1).abs_diff_eq(expected, 1e-6));
        assert_eq!(
            frames.eye_resolution(1),
            RenderSize {
                width: 1440,
                height: 1600
            }
        );
    }

    #[test]
    fn invalid_tracking_holds_last_known_pose() {
        let mut frames = running(ScriptedRuntime::stereo());
        frames.begin_frame().unwrap();
        frames.end_frame().unwrap();
        let good_view = frames.eye_view_matrix(0);

        for v in frames.runtime_mut().views.iter_mut() {
            v.pose.position = Vec3::new(50.0, 50.0, 50.0);
            v.validity = PoseValidity::ORIENTATION;
        }
        let outcome = frames.begin_frame().unwrap();
        assert!(matches!(outcome, FrameOutcome::RenderFully { .. }));
        assert!(frames.eye_view_matrix(0).abs_diff_eq(good_view, 1e-6));
        frames.end_frame().unwrap();
    }

    #[test]
    fn invalid_tracking_on_first_frame_uses_identity() {
        let mut runtime = ScriptedRuntime::stereo();
        for v in runtime.views.iter_mut() {
            v.validity = PoseValidity::empty();
        }
        let mut frames = running(runtime);
        frames.begin_frame().unwrap();
        assert_eq!(frames.eye_view_matrix(0), Mat4::IDENTITY);
        assert_eq!(frames.eye(1).render_info.pose, Pose::IDENTITY);
    }

    #[test]
    fn wait_failure_is_an_error() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.fail_wait = true;
        let mut frames = running(runtime);
        assert!(frames.begin_frame().is_err());
        assert_eq!(frames.runtime().count("acquire_image"), 0);
    }

    #[test]
    fn acquire_failure_is_an_error() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.fail_acquire = true;
        let mut frames = running(runtime);
        let err = frames.begin_frame().unwrap_err();
        assert!(format!("{err:#}").contains("acquire"));
    }

    #[test]
    fn view_count_mismatch_is_an_error() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.views.pop();
        let mut frames = running(runtime);
        assert!(frames.begin_frame().is_err());
    }

    #[test]
    fn stopping_ends_session_and_exiting_requests_exit() {
        let mut frames = running(ScriptedRuntime::stereo());
        frames.begin_frame().unwrap();
        frames.end_frame().unwrap();

        frames.runtime_mut().push_state(SessionState::Stopping);
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert!(!frames.is_session_running());
        assert!(!frames.is_exit_requested());
        assert_eq!(frames.runtime().count("end_session"), 1);

        frames.runtime_mut().push_state(SessionState::Idle);
        frames.runtime_mut().push_state(SessionState::Exiting);
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert!(frames.is_exit_requested());
        // Already ended; no second end.
        assert_eq!(frames.runtime().count("end_session"), 1);
    }

    #[test]
    fn loss_pending_ends_running_session() {
        let mut frames = running(ScriptedRuntime::stereo());
        frames.begin_frame().unwrap();
        frames.end_frame().unwrap();
        frames.runtime_mut().push_state(SessionState::LossPending);
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert!(frames.is_exit_requested());
        assert_eq!(frames.runtime().count("end_session"), 1);
    }

    #[test]
    fn event_failures_do_not_stop_draining() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.fail_begin_session = true;
        runtime.push_state(SessionState::Ready);
        runtime.events.push_back(Ok(RuntimeEvent::Other));
        runtime.push_state(SessionState::Synchronized);
        let mut frames = FrameLoop::new(runtime, FrameLoopConfig::default());

        // Both event-driven attempts and the per-frame retry fail, the
        // queue is still drained.
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert_eq!(frames.runtime().count("begin_session"), 3);
        assert!(frames.runtime().events.is_empty());
        assert_eq!(frames.session_state(), SessionState::Synchronized);

        frames.runtime_mut().fail_begin_session = false;
        frames.runtime_mut().push_state(SessionState::Visible);
        assert!(matches!(
            frames.begin_frame().unwrap(),
            FrameOutcome::RenderFully { .. }
        ));
    }

    #[test]
    fn failed_begin_is_retried_without_new_events() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.fail_begin_session = true;
        let mut frames = running(runtime);

        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
        assert!(!frames.is_session_running());

        // Still Ready, no further events queued.
        frames.runtime_mut().fail_begin_session = false;
        let outcome = frames.begin_frame().unwrap();
        assert!(matches!(outcome, FrameOutcome::RenderFully { .. }));
        assert!(frames.is_session_running());
        assert_eq!(frames.session_state(), SessionState::Ready);
        frames.end_frame().unwrap();

        // Once running, no further begin attempts.
        for _ in 0..5 {
            frames.begin_frame().unwrap();
            frames.end_frame().unwrap();
        }
        assert_eq!(frames.runtime().count("begin_session"), 3);
    }

    #[test]
    fn stopped_session_is_not_restarted_by_retry() {
        let mut frames = running(ScriptedRuntime::stereo());
        frames.begin_frame().unwrap();
        frames.end_frame().unwrap();
        frames.runtime_mut().push_state(SessionState::Stopping);
        frames.begin_frame().unwrap();
        frames.begin_frame().unwrap();
        assert!(!frames.is_session_running());
        assert_eq!(frames.runtime().count("begin_session"), 1);
    }

    #[test]
    fn poll_error_is_logged_not_returned() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.events.push_back(Err(anyhow!("event buffer lost")));
        let mut frames = FrameLoop::new(runtime, FrameLoopConfig::default());
        assert_eq!(frames.begin_frame().unwrap(), FrameOutcome::SkipFully);
    }

    #[test]
    fn instance_loss_requests_exit() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.events.push_back(Ok(RuntimeEvent::InstanceLossPending));
        let mut frames = FrameLoop::new(runtime, FrameLoopConfig::default());
        frames.begin_frame().unwrap();
        assert!(frames.is_exit_requested());
    }

    #[test]
    fn eye_count_is_not_fixed_to_two() {
        let mut runtime = ScriptedRuntime::stereo();
        runtime.eyes = 4;
        let extra = runtime.views.clone();
        runtime.views.extend(extra);
        let mut frames = running(runtime);
        frames.begin_frame().unwrap();
        frames.end_frame().unwrap();
        assert_eq!(frames.eye_count(), 4);
        assert_eq!(frames.runtime().submitted[0].1.len(), 4);
    }

    #[test]
    fn end_frame_without_begin_is_a_no_op() {
        let mut frames = FrameLoop::new(ScriptedRuntime::stereo(), FrameLoopConfig::default());
        frames.end_frame().unwrap();
        assert!(frames.runtime().calls.is_empty());
    }
}
