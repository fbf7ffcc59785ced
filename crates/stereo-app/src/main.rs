// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{anyhow, Context as _, Result};
use ash::vk;
use clap::Parser;
use stereo_core::{init_tracing, report, ErrorKind};
use stereo_math::{Mat4, Quat, Vec3};
use stereo_render::FrameOutcome;
use stereo_render_vk::{Context, FramePool, FrameSlot, Headset, RenderTarget, ScenePipeline};
use tracing::{error, info, warn};

use crate::config::{load_cfg, AppCfg};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg(long, default_value = "stereo.toml")]
    config: PathBuf,
    /// Overrides `xr.frames_in_flight`
    #[arg(long)]
    frames_in_flight: Option<usize>,
}

/// Set by Ctrl-C. A second Ctrl-C quits without draining the session.
static STOP: AtomicBool = AtomicBool::new(false);

fn install_interrupt_handler() {
    let installed = ctrlc::set_handler(|| {
        if STOP.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        info!("interrupt: ending session (again to force quit)");
    });
    if let Err(e) = installed {
        warn!("interrupt handler not installed: {e}");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shutdown {
    Continue,
    /// Ask the runtime to stop; the loop then drains Stopping and Exiting.
    RequestExit,
    /// No session to drain.
    Leave,
}

fn shutdown_step(stop: bool, exit_sent: bool, session_running: bool) -> Shutdown {
    match (stop, exit_sent, session_running) {
        (false, _, _) | (true, true, _) => Shutdown::Continue,
        (true, false, true) => Shutdown::RequestExit,
        (true, false, false) => Shutdown::Leave,
    }
}

/// What the render pass holds this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassContents {
    Scene,
    /// The uniforms were not written; the layers still get a cleared image.
    ClearOnly,
}

impl PassContents {
    fn for_uniforms(written: bool) -> Self {
        if written {
            PassContents::Scene
        } else {
            PassContents::ClearOnly
        }
    }
}

fn frame_loop_error(e: anyhow::Error) -> anyhow::Error {
    report(ErrorKind::FrameLoop, Some(&format!("{e:#}")))
}

/// Cube half a metre across, 1.5 m ahead, spinning about +Y.
fn cube_world(time: f32) -> Mat4 {
    Mat4::from_scale_rotation_translation(
        Vec3::splat(0.5),
        Quat::from_rotation_y(time * 0.5),
        Vec3::new(0.0, 0.0, -1.5),
    )
}

fn record_pass(
    device: &ash::Device,
    slot: &FrameSlot<'_>,
    render_pass: vk::RenderPass,
    target: &RenderTarget<'_>,
    clear_color: [f32; 4],
    scene: Option<&ScenePipeline<'_>>,
) -> Result<()> {
    let cmd = slot.command_buffer();
    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    unsafe { device.begin_command_buffer(cmd, &begin) }.context("begin_command_buffer")?;

    let clears = [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ];
    let rp_begin = vk::RenderPassBeginInfo {
        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
        render_pass,
        framebuffer: target.framebuffer(),
        render_area: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent(),
        },
        clear_value_count: clears.len() as u32,
        p_clear_values: clears.as_ptr(),
        ..Default::default()
    };
    unsafe {
        device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
    }
    if let Some(scene) = scene {
        scene.record(cmd, slot.descriptor_set(), target.extent());
    }
    unsafe { device.cmd_end_render_pass(cmd) };
    Ok(())
}

struct Renderer<'d> {
    ctx: &'d Context,
    // Slots are idle before the pipeline and the headset's targets go.
    pool: FramePool<'d>,
    scene: ScenePipeline<'d>,
    headset: Headset<'d>,
    cfg: AppCfg,
    time: f32,
}

impl<'d> Renderer<'d> {
    fn new(ctx: &'d Context, cfg: AppCfg) -> Result<Self> {
        let headset = Headset::new(ctx, cfg.xr.reference_space.into(), cfg.frame_loop())?;
        let pool = FramePool::new(ctx, cfg.xr.frames_in_flight, headset.eye_count())?;
        let scene = ScenePipeline::new(
            ctx.device(),
            headset.render_pass(),
            pool.set_layout(),
            headset.eye_count() as u32,
        )?;
        Ok(Self {
            ctx,
            pool,
            scene,
            headset,
            cfg,
            time: 0.0,
        })
    }

    fn draw(&mut self, image_index: u32, dt: f32) -> Result<()> {
        let headset = &self.headset;
        let target = headset
            .render_target(image_index)
            .ok_or_else(|| anyhow!("no render target for swapchain image {image_index}"))?;

        let slot = self.pool.next_slot()?;
        self.time += 2.0 * dt;
        slot.scene.world = cube_world(self.time);
        for (eye, vp) in slot.scene.view_projection.iter_mut().enumerate() {
            *vp = headset.eye_projection_matrix(eye) * headset.eye_view_matrix(eye);
        }
        slot.animation.time = self.time;
        let contents = PassContents::for_uniforms(slot.update_uniform_buffer_data());

        record_pass(
            self.ctx.device(),
            slot,
            headset.render_pass(),
            target,
            self.cfg.render.clear_color,
            (contents == PassContents::Scene).then_some(&self.scene),
        )?;
        slot.submit(self.ctx.queue())
    }

    fn run(&mut self) -> Result<()> {
        let mut last = Instant::now();
        let mut frames = 0u32;
        let mut last_fps_instant = last;
        let mut exit_sent = false;

        while !self.headset.is_exit_requested() {
            match shutdown_step(
                STOP.load(Ordering::SeqCst),
                exit_sent,
                self.headset.is_session_running(),
            ) {
                Shutdown::Continue => {}
                Shutdown::RequestExit => {
                    exit_sent = true;
                    if let Err(e) = self.headset.request_exit() {
                        warn!("request_exit failed, leaving without draining: {e:#}");
                        break;
                    }
                }
                Shutdown::Leave => break,
            }

            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f32();
            last = now;

            match self.headset.begin_frame().map_err(frame_loop_error)? {
                FrameOutcome::RenderFully { image_index } => {
                    let drawn = self.draw(image_index, dt);
                    // The frame is ended even when drawing failed.
                    let ended = self.headset.end_frame().map_err(frame_loop_error);
                    drawn?;
                    ended?;
                    frames = frames.saturating_add(1);
                }
                FrameOutcome::SkipRender => self.headset.end_frame().map_err(frame_loop_error)?,
                FrameOutcome::SkipFully => {
                    // No frame pacing from the runtime while idle.
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }

            if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
                info!("fps ~ {}", frames);
                frames = 0;
                last_fps_instant = now;
            }
        }
        info!("leaving frame loop ({})", self.headset.session_state().as_str());
        Ok(())
    }
}

fn run(cfg: AppCfg) -> Result<()> {
    let ctx = Context::new(&cfg.xr.application_name)?;
    let result = Renderer::new(&ctx, cfg).and_then(|mut r| r.run());
    ctx.sync()?;
    result
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    install_interrupt_handler();

    let mut cfg = load_cfg(&args.config);
    if let Some(n) = args.frames_in_flight {
        cfg.xr.frames_in_flight = n;
    }
    if cfg.validate().is_err() {
        return ExitCode::FAILURE;
    }
    info!(
        "config: app={} space={:?} frames_in_flight={}",
        cfg.xr.application_name, cfg.xr.reference_space, cfg.xr.frames_in_flight
    );

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
