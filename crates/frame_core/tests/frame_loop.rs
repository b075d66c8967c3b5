//! Frame loop behaviour against the recording device

use ash::vk;
use frame_core::gpu::{GpuDevice, PipelineDesc, ResourceId};
use frame_core::headless::{FailPoint, RecordedCommand, RecordingDevice};
use frame_core::mesh::Mesh;
use frame_core::prelude::*;

fn orchestrator(slots: usize) -> FrameOrchestrator<RecordingDevice> {
    let config = EngineConfig::new("frame loop test")
        .with_frame_slots(slots)
        .with_max_objects(16);
    let mut frames = FrameOrchestrator::init(RecordingDevice::new(), config).unwrap();

    let material = frames
        .create_material("defaultmesh", &PipelineDesc::new("tri_mesh.vert.spv", "default_lit.frag.spv"))
        .unwrap();
    let triangle = frames.upload_geometry("triangle", &Mesh::triangle()).unwrap();
    for x in 0..3 {
        let transform = Matrix4::new_translation(&Vector3::new(x as f32, 0.0, 0.0));
        frames
            .add_renderable(RenderableEntry::new(triangle, material, transform))
            .unwrap();
    }
    frames.device_mut().take_commands();
    frames
}

fn waited_slots(frames: &FrameOrchestrator<RecordingDevice>) -> Vec<usize> {
    let fences: Vec<_> = frames.ring().slots().iter().map(|slot| slot.render_fence).collect();
    frames
        .device()
        .commands()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::WaitFence(fence) => fences.iter().position(|f| f == fence),
            _ => None,
        })
        .collect()
}

#[test]
fn test_five_frames_alternate_between_two_slots() {
    let mut frames = orchestrator(2);
    for _ in 0..5 {
        frames.draw_one_frame().unwrap();
    }

    let commands = frames.device().commands();
    let count = |pred: fn(&RecordedCommand) -> bool| commands.iter().filter(|c| pred(c)).count();
    assert_eq!(count(|c| matches!(c, RecordedCommand::WaitFence(_))), 5);
    assert_eq!(count(|c| matches!(c, RecordedCommand::ResetFence(_))), 5);
    assert_eq!(count(|c| matches!(c, RecordedCommand::Submit { .. })), 5);
    assert_eq!(count(|c| matches!(c, RecordedCommand::Present { .. })), 5);

    assert_eq!(waited_slots(&frames), vec![0, 1, 0, 1, 0]);
    assert_eq!(frames.frame_number(), 5);
}

#[test]
fn test_slot_selection_is_periodic() {
    let mut frames = orchestrator(3);
    for _ in 0..7 {
        frames.draw_one_frame().unwrap();
    }
    assert_eq!(waited_slots(&frames), vec![0, 1, 2, 0, 1, 2, 0]);
    for k in 0..7 {
        assert_eq!(frames.ring().slot_index_for(k), (k % 3) as usize);
    }
}

#[test]
fn test_fence_is_waited_before_reset_every_frame() {
    let mut frames = orchestrator(2);
    for _ in 0..3 {
        frames.draw_one_frame().unwrap();
    }

    let commands = frames.device().commands();
    for (index, command) in commands.iter().enumerate() {
        if let RecordedCommand::ResetFence(fence) = command {
            assert_eq!(commands[index - 1], RecordedCommand::WaitFence(*fence));
        }
    }
}

#[test]
fn test_scene_replica_offsets_follow_slots() {
    let mut frames = orchestrator(2);
    for _ in 0..4 {
        frames.draw_one_frame().unwrap();
    }

    let offsets: Vec<Vec<u32>> = frames
        .device()
        .commands()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::BindDescriptorSets { dynamic_offsets, .. } => Some(dynamic_offsets.clone()),
            _ => None,
        })
        .collect();
    // One material, so one descriptor bind per frame
    assert_eq!(offsets, vec![vec![0], vec![256], vec![0], vec![256]]);
}

#[test]
fn test_submit_and_present_use_the_slot_semaphores() {
    let mut frames = orchestrator(2);
    frames.draw_one_frame().unwrap();

    let slot = frames.ring().slot(0).unwrap().clone();
    let commands = frames.device().commands();
    let acquired = commands
        .iter()
        .find_map(|command| match command {
            RecordedCommand::AcquireImage { signal, image_index } => Some((*signal, *image_index)),
            _ => None,
        })
        .unwrap();
    assert_eq!(acquired.0, slot.image_acquired);

    assert!(commands.contains(&RecordedCommand::Submit {
        target: slot.commands,
        wait: slot.image_acquired,
        signal: slot.render_finished,
        fence: slot.render_fence,
    }));
    assert!(commands.contains(&RecordedCommand::Present {
        image_index: acquired.1,
        wait: slot.render_finished,
    }));
}

#[test]
fn test_draws_are_instanced_by_list_position() {
    let mut frames = orchestrator(2);
    let stats = frames.draw_one_frame().unwrap();
    assert_eq!(stats.draws, 3);
    assert_eq!(stats.pipeline_binds, 1);
    assert_eq!(stats.vertex_buffer_binds, 1);

    let first_instances: Vec<u32> = frames
        .device()
        .commands()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::Draw {
                first_instance,
                vertex_count,
                ..
            } => {
                assert_eq!(*vertex_count, 3);
                Some(*first_instance)
            }
            _ => None,
        })
        .collect();
    assert_eq!(first_instances, vec![0, 1, 2]);
}

#[test]
fn test_slot_buffers_are_written_only_after_their_fence_wait() {
    let mut frames = orchestrator(2);
    for _ in 0..4 {
        frames.draw_one_frame().unwrap();
    }

    let slots = frames.ring().slots().to_vec();
    let scene_buffer = frames.ring().scene_buffer();
    let scene_layout = frames.ring().scene_layout();
    let mut current: Option<usize> = None;
    let mut writes = 0;
    for command in frames.device().commands() {
        match command {
            RecordedCommand::WaitFence(fence) => {
                current = slots.iter().position(|slot| slot.render_fence == *fence);
            }
            RecordedCommand::Submit { .. } => current = None,
            RecordedCommand::WriteBuffer { buffer, offset, .. } => {
                let slot = current.expect("buffer written outside the fenced part of a frame");
                if *buffer == scene_buffer {
                    assert_eq!(*offset, scene_layout.offset(slot));
                } else {
                    let owner = slots
                        .iter()
                        .position(|s| s.camera_buffer == *buffer || s.object_buffer == *buffer)
                        .unwrap();
                    assert_eq!(owner, slot);
                }
                writes += 1;
            }
            _ => {}
        }
    }
    // Camera, scene replica and object array per frame
    assert_eq!(writes, 4 * 3);
}

#[test]
fn test_pending_slot_buffers_reject_host_writes() {
    let mut frames = orchestrator(2);
    frames.device_mut().stall_gpu(true);
    frames.draw_one_frame().unwrap();

    let slot0 = frames.ring().slot(0).unwrap().clone();
    let slot1 = frames.ring().slot(1).unwrap().clone();
    let scene_buffer = frames.ring().scene_buffer();
    let block = [0u8; 16];
    let device = frames.device_mut();
    assert!(device.write_buffer(slot0.camera_buffer, 0, &block).is_err());
    assert!(device.write_buffer(slot0.object_buffer, 0, &block).is_err());
    assert!(device.write_buffer(scene_buffer, 0, &block).is_err());

    // The other slot and its scene replica stay writable
    device.write_buffer(slot1.camera_buffer, 0, &block).unwrap();
    device.write_buffer(scene_buffer, 256, &block).unwrap();

    device.complete_pending();
    device.write_buffer(slot0.camera_buffer, 0, &block).unwrap();
}

#[test]
fn test_submit_failure_aborts_the_loop() {
    let mut frames = orchestrator(2);
    frames.draw_one_frame().unwrap();

    frames
        .device_mut()
        .fail_next(FailPoint::Submit, vk::Result::ERROR_DEVICE_LOST);
    let err = frames.draw_one_frame().unwrap_err();
    assert!(matches!(err, FrameError::Gpu { operation: "queue submit", .. }));
    assert!(err.is_fatal());
    assert_eq!(frames.state(), FrameState::Aborted);

    // The counter did not move past the failed frame
    assert_eq!(frames.frame_number(), 1);
    assert!(matches!(frames.draw_one_frame(), Err(FrameError::Aborted)));
    assert!(matches!(frames.run(|| false), Err(FrameError::Aborted)));
}

#[test]
fn test_stalled_gpu_times_out_on_slot_reuse() {
    let mut frames = orchestrator(2);
    frames.device_mut().stall_gpu(true);

    // Both slots start signaled, so the first lap succeeds
    frames.draw_one_frame().unwrap();
    frames.draw_one_frame().unwrap();

    match frames.draw_one_frame() {
        Err(FrameError::Timeout { what, timeout }) => {
            assert_eq!(what, "render fence");
            assert_eq!(timeout, frames.config().fence_timeout());
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(frames.state(), FrameState::Aborted);

    // wait_idle in cleanup drains the stalled work
    frames.cleanup().unwrap();
    assert_eq!(frames.device().live_resources(), 0);
}

#[test]
fn test_cleanup_destroys_everything_in_reverse_order() {
    let mut frames = orchestrator(2);
    frames.draw_one_frame().unwrap();

    let first_fence: ResourceId = frames.ring().slot(0).unwrap().render_fence.into();
    let material = frames.registry().get_material("defaultmesh").unwrap();
    let entry = frames.registry().material(material).unwrap().clone();
    let geometry = frames.registry().get_geometry("triangle").unwrap();
    let vertex_buffer: ResourceId = frames.registry().geometry(geometry).unwrap().vertex_buffer.into();

    frames.cleanup().unwrap();
    assert!(!frames.is_initialized());
    assert_eq!(frames.device().live_resources(), 0);

    let commands = frames.device().commands();
    let wait_idle = commands.iter().position(|c| *c == RecordedCommand::WaitIdle).unwrap();
    let destroyed: Vec<ResourceId> = commands[wait_idle..]
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::Destroy(id) => Some(*id),
            _ => None,
        })
        .collect();
    let position = |id: ResourceId| destroyed.iter().position(|d| *d == id).unwrap();

    // Last registered goes first; the first fence created goes last
    assert_eq!(destroyed.first(), Some(&vertex_buffer));
    assert_eq!(destroyed.last(), Some(&first_fence));
    assert!(position(entry.pipeline.into()) < position(entry.layout.into()));

    // A second cleanup does nothing
    let before = frames.device().commands().len();
    frames.cleanup().unwrap();
    assert_eq!(frames.device().commands().len(), before);
    assert!(matches!(frames.draw_one_frame(), Err(FrameError::NotInitialized)));
}

#[test]
fn test_run_reports_frames_drawn() {
    let mut frames = orchestrator(2);
    let mut remaining = 4;
    let drawn = frames
        .run(|| {
            if remaining == 0 {
                return true;
            }
            remaining -= 1;
            false
        })
        .unwrap();
    assert_eq!(drawn, 4);
    assert_eq!(frames.device().min_uniform_buffer_offset_alignment(), 256);
}
