use std::sync::Arc;

use nalgebra::Vector2;

use crate::graphics::backend::{
    BufferDesc, BufferUsage, ClearValue, DeviceBackend, DeviceConfig, ImageDesc, ImageFormat,
    ImageUsage, LoadOp,
};
use crate::graphics::barrier::{AccessFlags, ImageLayout, PipelineStage};
use crate::graphics::cmd::{CmdBufferPool, CmdQueue};
use crate::graphics::descriptor::DescriptorArray;
use crate::graphics::frame_graph::{FrameGraph, FrameGraphError, PassKind};
use crate::graphics::headless::{HeadlessDevice, HeadlessRecorder, RecordedCommand};
use crate::graphics::lifetime::{DeferredDestroy, LifetimeManager, ResourceFence};

fn device() -> Arc<HeadlessDevice> {
    Arc::new(HeadlessDevice::new(DeviceConfig::from_env()).unwrap())
}

fn color_target(size: u32) -> ImageDesc {
    ImageDesc {
        size: Vector2::new(size, size),
        format: ImageFormat::Rgba8Unorm,
        usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
    }
}

#[test]
fn write_then_read_emits_one_barrier() {
    let device = device();

    let mut graph = FrameGraph::new();
    let mut handle = None;
    graph.add_pass("draw", PassKind::Graphics, |builder| {
        let mut img = builder.create_image("hdr", color_target(64));
        builder.render_to(&mut img, LoadOp::Clear);
        handle = Some(img);
        move |_recorder: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });
    let mut img = handle.unwrap();
    graph.add_pass("sample", PassKind::Compute, |builder| {
        builder.read(&mut img, PipelineStage::FRAGMENT);
        move |_recorder: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });

    let compiled = graph.compile(device.as_ref()).unwrap();
    assert_eq!(compiled.schedule(), &[0, 1]);
    assert!(compiled.barriers_before(0).is_empty());

    let barriers = compiled.barriers_before(1);
    assert_eq!(barriers.len(), 1);
    let barrier = &barriers[0];
    assert_eq!(barrier.src_stage, PipelineStage::COLOR_ATTACHMENT_OUTPUT);
    assert_eq!(barrier.src_access, AccessFlags::COLOR_ATTACHMENT_WRITE);
    assert_eq!(barrier.dst_stage, PipelineStage::FRAGMENT);
    assert_eq!(barrier.dst_access, AccessFlags::SHADER_READ);
    assert_eq!(barrier.old_layout, Some(ImageLayout::ColorAttachment));
    assert_eq!(barrier.new_layout, Some(ImageLayout::ShaderReadOnly));
}

#[test]
fn cycle_fails_compilation() {
    let device = device();

    let mut graph = FrameGraph::new();
    let mut a = None;
    let mut b = None;
    graph.add_pass("p1", PassKind::Compute, |builder| {
        let mut res_a = builder.create_image("a", color_target(8));
        let mut res_b = builder.create_image("b", color_target(8));
        builder.read(&mut res_a, PipelineStage::COMPUTE);
        builder.write(&mut res_b, PipelineStage::COMPUTE);
        a = Some(res_a);
        b = Some(res_b);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });
    let mut a = a.unwrap();
    let mut b = b.unwrap();
    graph.add_pass("p2", PassKind::Compute, |builder| {
        builder.read(&mut b, PipelineStage::COMPUTE);
        builder.write(&mut a, PipelineStage::COMPUTE);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });

    match graph.compile(device.as_ref()) {
        Err(FrameGraphError::CyclicGraph) => {}
        other => panic!("Expected a cycle error, got {:?}", other.err()),
    }
}

#[test]
fn uninitialized_read_fails_compilation() {
    let device = device();

    let mut graph = FrameGraph::new();
    graph.add_pass("reader", PassKind::Compute, |builder| {
        let mut img = builder.create_image("never_written", color_target(8));
        builder.read(&mut img, PipelineStage::COMPUTE);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });

    match graph.compile(device.as_ref()) {
        Err(FrameGraphError::UninitializedRead { resource }) => {
            assert_eq!(resource, "never_written");
        }
        other => panic!("Expected an uninitialized read error, got {:?}", other.err()),
    }
}

#[test]
fn attachment_sizes_must_match() {
    let device = device();

    let mut graph = FrameGraph::new();
    graph.add_pass("mismatched", PassKind::Graphics, |builder| {
        let mut big = builder.create_image("big", color_target(64));
        let mut small = builder.create_image("small", color_target(32));
        builder.render_to(&mut big, LoadOp::Clear);
        builder.render_to(&mut small, LoadOp::Clear);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });

    assert!(matches!(
        graph.compile(device.as_ref()),
        Err(FrameGraphError::AttachmentSizeMismatch { .. })
    ));
}

#[test]
fn linear_order_is_a_topological_sort() {
    let device = device();

    // c depends on b depends on a, with a second independent chain.
    let mut graph = FrameGraph::new();
    let mut img = None;
    graph.add_pass("a", PassKind::Compute, |builder| {
        let mut res = builder.create_image("chain", color_target(16));
        builder.write(&mut res, PipelineStage::COMPUTE);
        img = Some(res);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });
    let mut chain = img.unwrap();
    graph.add_pass("b", PassKind::Compute, |builder| {
        builder.write(&mut chain, PipelineStage::COMPUTE);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });
    graph.add_pass("standalone", PassKind::Compute, |builder| {
        let mut other = builder.create_image("other", color_target(16));
        builder.write(&mut other, PipelineStage::COMPUTE);
        builder.read(&mut other, PipelineStage::COMPUTE);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });
    graph.add_pass("c", PassKind::Compute, |builder| {
        builder.read(&mut chain, PipelineStage::COMPUTE);
        move |_r: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {}
    });

    let compiled = graph.compile(device.as_ref()).unwrap();
    let schedule = compiled.schedule();
    let position = |pass: u32| schedule.iter().position(|p| *p == pass).unwrap();
    assert!(position(0) < position(1));
    assert!(position(1) < position(3));
    assert_eq!(schedule.len(), 4);
}

#[test]
fn recording_emits_render_pass_and_commands() {
    let device = device();
    let lifetime = Arc::new(LifetimeManager::new(device.clone()));

    let mut graph = FrameGraph::new();
    let mut target = None;
    graph.add_pass("clear", PassKind::Graphics, |builder| {
        let mut img = builder.create_image("target", color_target(32));
        builder.render_to(&mut img, LoadOp::Clear);
        target = Some(img);
        move |recorder: &mut dyn crate::graphics::backend::CmdRecorder,
              _res: &crate::graphics::frame_graph::FrameGraphResources| {
            recorder.draw(3, 1);
        }
    });

    let compiled = graph.compile(device.as_ref()).unwrap();
    let mut recorder = HeadlessRecorder::new();
    let resources = compiled.record(&mut recorder);

    assert!(matches!(
        recorder.commands[0],
        RecordedCommand::BeginRenderPass { ref attachments, .. }
            if attachments.len() == 1
                && attachments[0].load_op == LoadOp::Clear
                && attachments[0].clear == ClearValue::Color([0.0; 4])
    ));
    assert!(matches!(
        recorder.commands[1],
        RecordedCommand::Draw { vertices: 3, instances: 1 }
    ));
    assert!(matches!(recorder.commands[2], RecordedCommand::EndRenderPass));

    resources.release(&lifetime);
    lifetime.wait_all_queues();
    drop(lifetime);
    assert_eq!(device.live_handles(), 0);
}

#[test]
fn lifetime_frees_only_after_fence_signals() {
    let device = device();
    let lifetime = Arc::new(LifetimeManager::new(device.clone() as Arc<dyn DeviceBackend>));
    let pool = CmdBufferPool::new(device.clone());
    let queue = CmdQueue::new(device.clone() as Arc<dyn DeviceBackend>, lifetime.clone());

    let image = device
        .create_image(&color_target(16))
        .expect("Image creation cannot fail headless.");

    // Destroy-later before any submission: freed once the stamped fence is
    // covered.
    lifetime.destroy_later(DeferredDestroy::Image(image));
    lifetime.collect();
    assert_eq!(lifetime.pending_destructions(), 1);

    let mut cmd = pool.allocate();
    let submitted = queue.submit(&mut cmd);
    assert_eq!(submitted, ResourceFence(1));
    drop(cmd);

    // GPU has not reported completion yet.
    lifetime.collect();
    assert_eq!(lifetime.pending_destructions(), 1);
    assert_eq!(lifetime.last_signalled(), ResourceFence(0));

    device.complete_all();
    lifetime.collect();
    assert_eq!(lifetime.pending_destructions(), 0);
    assert!(lifetime.last_signalled() >= ResourceFence(1));
    assert_eq!(device.live_handles_of("image"), 0);
}

#[test]
fn cmd_pool_recycles_signalled_buffers() {
    let device = device();
    let lifetime = Arc::new(LifetimeManager::new(device.clone() as Arc<dyn DeviceBackend>));
    let queue = CmdQueue::new(device.clone() as Arc<dyn DeviceBackend>, lifetime.clone());
    let pool = CmdBufferPool::new(device.clone());

    let mut first = pool.allocate();
    let first_raw = first.raw();
    queue.submit(&mut first);
    drop(first);

    // Still in flight: allocation must create a fresh buffer.
    let second = pool.allocate();
    assert_ne!(second.raw(), first_raw);
    drop(second);

    device.complete_all();

    // Now the first buffer's fence has signalled and it gets recycled.
    let third = pool.allocate();
    let reused = third.raw();
    assert!(reused == first_raw || pool.parked_buffers() > 0);
    drop(third);

    lifetime.wait_all_queues();
}

#[test]
fn wait_all_queues_flushes_everything() {
    let device = device();
    let lifetime = Arc::new(LifetimeManager::new(device.clone() as Arc<dyn DeviceBackend>));

    let buffer = device
        .create_buffer(&BufferDesc {
            size: 256,
            usage: BufferUsage::STORAGE,
        })
        .unwrap();
    lifetime.destroy_later(DeferredDestroy::Buffer(buffer));

    lifetime.wait_all_queues();
    assert_eq!(lifetime.pending_destructions(), 0);
    assert_eq!(device.live_handles_of("buffer"), 0);
}

#[test]
fn descriptor_array_defers_view_destruction() {
    let device = device();
    let lifetime = Arc::new(LifetimeManager::new(device.clone() as Arc<dyn DeviceBackend>));

    let image = device.create_image(&color_target(8)).unwrap();
    let view = device.create_image_view(image).unwrap();

    let array = DescriptorArray::new(
        &(device.clone() as Arc<dyn DeviceBackend>),
        lifetime.clone(),
        64,
    )
    .unwrap();

    let index = array.add(view);
    assert_eq!(array.get(index), Some(view));
    assert_eq!(array.len(), 1);

    array.remove(index);
    assert_eq!(array.len(), 0);
    // The view is parked in the lifetime queue, not destroyed inline.
    assert_eq!(device.live_handles_of("image_view"), 1);

    lifetime.wait_all_queues();
    assert_eq!(device.live_handles_of("image_view"), 0);

    drop(array);
    lifetime.wait_all_queues();
    assert_eq!(device.live_handles_of("descriptor_pool"), 0);
    assert_eq!(device.live_handles_of("descriptor_set_layout"), 0);

    device.destroy_image(image);
}
