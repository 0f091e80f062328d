use std::path::Path;
use std::sync::Arc;

use nalgebra::Vector2;

use crate::assets::scene::{self, SceneError};
use crate::graphics::backend::{
    BufferDesc, BufferUsage, CmdRecorder, DeviceBackend, DeviceConfig, DeviceError, ImageDesc,
    ImageFormat, ImageUsage, LoadOp,
};
use crate::graphics::barrier::PipelineStage;
use crate::graphics::cmd::{CmdBufferPool, CmdQueue};
use crate::graphics::descriptor::DescriptorArray;
use crate::graphics::frame_graph::{FrameGraph, FrameGraphError, FrameGraphResources, PassKind};
use crate::graphics::headless::{HeadlessDevice, HeadlessRecorder};
use crate::graphics::lifetime::LifetimeManager;
use crate::settings::Settings;
use crate::world::undo::UndoRedoSystem;
use crate::world::World;

pub struct AppOptions {
    pub no_debug: bool,
    pub headless: bool,
}

/// The editor host: owns the device stack, the world and the frame loop.
pub struct App {
    settings: Settings,
    device: Arc<HeadlessDevice>,
    lifetime: Arc<LifetimeManager>,
    queue: CmdQueue,
    cmd_pool: CmdBufferPool,
    bindless: DescriptorArray,
    world: World,
    frame_index: u64,
}

impl App {
    pub fn new(options: &AppOptions) -> Result<Self, DeviceError> {
        let settings = Settings::load();

        let mut config = DeviceConfig::from_env();
        if options.no_debug {
            config.validation = false;
        }
        if !options.headless {
            // Window and input glue live outside this crate; without them
            // every run drives the headless device.
            log::info!("No presentation surface available, running headless.");
        }

        let device = Arc::new(HeadlessDevice::new(config)?);
        let backend: Arc<dyn DeviceBackend> = device.clone();
        let lifetime = Arc::new(LifetimeManager::new(backend.clone()));
        let queue = CmdQueue::new(backend.clone(), lifetime.clone());
        let cmd_pool = CmdBufferPool::new(backend.clone());
        let bindless = DescriptorArray::new(&backend, lifetime.clone(), settings.bindless_capacity)?;

        let mut world = World::new();
        world.register_system(Box::new(UndoRedoSystem::new()));

        Ok(Self {
            settings,
            device,
            lifetime,
            queue,
            cmd_pool,
            bindless,
            world,
            frame_index: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn load_scene(&mut self, path: &Path) -> Result<(), SceneError> {
        let world = scene::load_from_file(path)?;
        log::info!(
            "Loaded scene {} with {} entities.",
            path.display(),
            world.entity_count()
        );
        self.world = world;
        self.world.register_system(Box::new(UndoRedoSystem::new()));
        Ok(())
    }

    /// One frame: tick the world, declare the standard pass chain, compile,
    /// record, submit, then let the collector reclaim what the fences allow.
    pub fn frame(&mut self) -> Result<(), FrameGraphError> {
        self.world.tick();

        let size = Vector2::new(self.settings.render_size.0, self.settings.render_size.1);
        let mut graph = FrameGraph::new();

        let mut gbuffer = None;
        let mut depth = None;
        graph.add_pass("gbuffer", PassKind::Graphics, |builder| {
            let mut color = builder.create_image(
                "gbuffer_color",
                ImageDesc {
                    size,
                    format: ImageFormat::Rgba16Float,
                    usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
                },
            );
            let mut depth_target = builder.create_image(
                "gbuffer_depth",
                ImageDesc {
                    size,
                    format: ImageFormat::Depth32Float,
                    usage: ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED,
                },
            );
            builder.render_to(&mut color, LoadOp::Clear);
            builder.set_depth(&mut depth_target, LoadOp::Clear);
            gbuffer = Some(color);
            depth = Some(depth_target);

            let draw_count = 1u32;
            move |recorder: &mut dyn CmdRecorder, _resources: &FrameGraphResources| {
                recorder.draw(3, draw_count);
            }
        });

        let mut gbuffer = gbuffer.expect("Setup ran synchronously.");
        let mut depth = depth.expect("Setup ran synchronously.");

        let mut lit = None;
        graph.add_pass("lighting", PassKind::Compute, |builder| {
            let mut hdr = builder.create_image(
                "lit_hdr",
                ImageDesc {
                    size,
                    format: ImageFormat::Rgba16Float,
                    usage: ImageUsage::STORAGE | ImageUsage::SAMPLED,
                },
            );
            builder.read(&mut gbuffer, PipelineStage::COMPUTE);
            builder.read(&mut depth, PipelineStage::COMPUTE);
            builder.write(&mut hdr, PipelineStage::COMPUTE);
            lit = Some(hdr);

            let groups = [size.x.div_ceil(8), size.y.div_ceil(8), 1];
            move |recorder: &mut dyn CmdRecorder, _resources: &FrameGraphResources| {
                recorder.dispatch(groups);
            }
        });
        let mut lit = lit.expect("Setup ran synchronously.");

        let mut exposure = None;
        graph.add_pass("exposure_readback", PassKind::Transfer, |builder| {
            let mut staging = builder.create_buffer(
                "exposure_staging",
                BufferDesc {
                    size: 256,
                    usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                },
            );
            builder.read(&mut lit, PipelineStage::TRANSFER);
            builder.write(&mut staging, PipelineStage::TRANSFER);
            exposure = Some(staging);

            let src = lit;
            let dst = staging;
            move |recorder: &mut dyn CmdRecorder, resources: &FrameGraphResources| {
                recorder.copy_image_to_buffer(resources.image(&src), resources.buffer(&dst));
            }
        });
        let _ = exposure;

        let mut present = None;
        graph.add_pass("present_copy", PassKind::External, |builder| {
            let mut target = builder.create_image(
                "present_target",
                ImageDesc {
                    size,
                    format: ImageFormat::Rgba8Srgb,
                    usage: ImageUsage::TRANSFER_DST,
                },
            );
            builder.read(&mut lit, PipelineStage::TRANSFER);
            builder.write(&mut target, PipelineStage::TRANSFER);
            present = Some(target);

            let src = lit;
            let dst = target;
            move |recorder: &mut dyn CmdRecorder, resources: &FrameGraphResources| {
                recorder.copy_image(resources.image(&src), resources.image(&dst));
            }
        });
        let _ = present;

        let compiled = graph.compile(self.device.as_ref())?;

        let mut cmd = self.cmd_pool.allocate();
        let mut recorder = HeadlessRecorder::new();
        let resources = compiled.record(&mut recorder);
        // Released before the submission so the transients are stamped with
        // this frame's fence and freed as soon as it signals.
        resources.release(&self.lifetime);
        let fence = self.queue.submit(&mut cmd);
        drop(cmd);

        // The headless device has no GPU behind it; completing the
        // submission here plays the role of the fence signal.
        self.device.complete_all();
        self.lifetime.collect();

        self.frame_index += 1;
        log::debug!(
            "Frame {} submitted at resource fence {:?}.",
            self.frame_index,
            fence
        );
        Ok(())
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        for _ in 0..self.settings.headless_frame_count {
            // A failed frame aborts that frame only; the next one starts
            // clean.
            if let Err(e) = self.frame() {
                log::error!("Frame aborted: {}", e);
            }
        }
        Ok(())
    }

    pub fn shutdown(self) {
        drop(self.bindless);
        self.lifetime.wait_all_queues();
        if let Err(e) = self.settings.save() {
            log::warn!("Failed to save settings: {}", e);
        }
    }
}
