use std::sync::Arc;

use anyhow::{ensure, Context};
use nalgebra::Vector2;

use crate::graphics::backend::{
    DeviceBackend, DeviceConfig, ImageDesc, ImageFormat, ImageUsage, LoadOp,
};
use crate::graphics::barrier::{AccessFlags, PipelineStage};
use crate::graphics::cmd::{CmdBufferPool, CmdQueue};
use crate::graphics::frame_graph::{FrameGraph, FrameGraphError, FrameGraphResources, PassKind};
use crate::graphics::headless::HeadlessDevice;
use crate::graphics::lifetime::{DeferredDestroy, LifetimeManager};
use crate::world::components::NameComponent;
use crate::world::World;

/// Runtime self-checks behind `--run-tests`. These mirror the invariants
/// the unit tests cover, but run in the shipped binary against the live
/// stack, so a broken build fails loudly in CI and on user machines.
pub fn run_self_tests() -> anyhow::Result<()> {
    entity_identity().context("entity identity")?;
    stale_component_refs().context("stale component refs")?;
    frame_graph_barriers().context("frame graph barriers")?;
    frame_graph_cycle().context("frame graph cycle detection")?;
    lifetime_collection().context("lifetime collection")?;
    log::info!("All self tests passed.");
    Ok(())
}

fn entity_identity() -> anyhow::Result<()> {
    let mut world = World::new();
    let e1 = world.create_entity();
    world.remove_entity(e1);
    world.commit();
    let e2 = world.create_entity();

    ensure!(e1.index() == e2.index(), "index was not recycled");
    ensure!(e1.generation() + 1 == e2.generation(), "generation did not advance");
    ensure!(!world.exists(e1) && world.exists(e2), "liveness mismatch");
    Ok(())
}

fn stale_component_refs() -> anyhow::Result<()> {
    let mut world = World::new();
    let e = world.create_entity();
    let r = world.add_component(e, NameComponent::new("probe"));

    ensure!(world.get(r).is_some(), "fresh ref did not resolve");
    world.remove_component::<NameComponent>(e);
    world.commit();
    ensure!(world.get(r).is_none(), "stale ref resolved");
    Ok(())
}

fn frame_graph_barriers() -> anyhow::Result<()> {
    let device = HeadlessDevice::new(DeviceConfig::from_env())?;

    let mut graph = FrameGraph::new();
    let mut handle = None;
    graph.add_pass("produce", PassKind::Graphics, |builder| {
        let mut img = builder.create_image(
            "color",
            ImageDesc {
                size: Vector2::new(8, 8),
                format: ImageFormat::Rgba8Unorm,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
            },
        );
        builder.render_to(&mut img, LoadOp::Clear);
        handle = Some(img);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder, _res: &FrameGraphResources| {}
    });
    let mut img = handle.expect("Setup ran synchronously.");
    graph.add_pass("consume", PassKind::Compute, |builder| {
        builder.read(&mut img, PipelineStage::FRAGMENT);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder, _res: &FrameGraphResources| {}
    });

    let compiled = graph
        .compile(&device)
        .context("compiling the probe graph")?;
    ensure!(compiled.schedule() == [0, 1], "schedule is not topological");
    let barriers = compiled.barriers_before(1);
    ensure!(barriers.len() == 1, "expected exactly one barrier");
    ensure!(
        barriers[0].src_access == AccessFlags::COLOR_ATTACHMENT_WRITE
            && barriers[0].dst_access == AccessFlags::SHADER_READ,
        "barrier access masks are wrong"
    );
    Ok(())
}

fn frame_graph_cycle() -> anyhow::Result<()> {
    let device = HeadlessDevice::new(DeviceConfig::from_env())?;

    let mut graph = FrameGraph::new();
    let mut a = None;
    let mut b = None;
    graph.add_pass("p1", PassKind::Compute, |builder| {
        let mut res_a = builder.create_buffer(
            "a",
            crate::graphics::backend::BufferDesc {
                size: 64,
                usage: crate::graphics::backend::BufferUsage::STORAGE,
            },
        );
        let mut res_b = builder.create_buffer(
            "b",
            crate::graphics::backend::BufferDesc {
                size: 64,
                usage: crate::graphics::backend::BufferUsage::STORAGE,
            },
        );
        builder.read(&mut res_a, PipelineStage::COMPUTE);
        builder.write(&mut res_b, PipelineStage::COMPUTE);
        a = Some(res_a);
        b = Some(res_b);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder, _res: &FrameGraphResources| {}
    });
    let mut a = a.expect("Setup ran synchronously.");
    let mut b = b.expect("Setup ran synchronously.");
    graph.add_pass("p2", PassKind::Compute, |builder| {
        builder.read(&mut b, PipelineStage::COMPUTE);
        builder.write(&mut a, PipelineStage::COMPUTE);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder, _res: &FrameGraphResources| {}
    });

    ensure!(
        matches!(graph.compile(&device), Err(FrameGraphError::CyclicGraph)),
        "cycle was not detected"
    );
    Ok(())
}

fn lifetime_collection() -> anyhow::Result<()> {
    let device = Arc::new(HeadlessDevice::new(DeviceConfig::from_env())?);
    let backend: Arc<dyn DeviceBackend> = device.clone();
    let lifetime = Arc::new(LifetimeManager::new(backend.clone()));
    let pool = CmdBufferPool::new(backend.clone());
    let queue = CmdQueue::new(backend, lifetime.clone());

    let image = device.create_image(&ImageDesc {
        size: Vector2::new(4, 4),
        format: ImageFormat::Rgba8Unorm,
        usage: ImageUsage::SAMPLED,
    })?;
    lifetime.destroy_later(DeferredDestroy::Image(image));

    let mut cmd = pool.allocate();
    queue.submit(&mut cmd);
    drop(cmd);

    lifetime.collect();
    ensure!(
        device.live_handles_of("image") == 1,
        "image was freed before its fence signalled"
    );

    device.complete_all();
    lifetime.collect();
    ensure!(
        device.live_handles_of("image") == 0,
        "image survived its fence"
    );

    lifetime.wait_all_queues();
    Ok(())
}
