//! Mesh grid viewer
//!
//! Opens a window, uploads a triangle (and the monkey mesh when it is present
//! next to the binary's working directory), lays out a 40x40 grid of
//! triangles and draws frames until the window is closed or Escape is
//! pressed.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use frame_core::logging;
use frame_core::mesh::MeshError;
use frame_core::prelude::*;
use frame_core::vulkan::{VulkanDevice, Window, WindowError};
use glfw::{Action, Key, WindowEvent};
use thiserror::Error;

const CONFIG_PATH: &str = "engine.toml";
const MONKEY_PATH: &str = "assets/monkey_smooth.obj";
const GRID_HALF_EXTENT: i32 = 20;

#[derive(Error, Debug)]
enum ViewerError {
    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Failed to load mesh: {0}")]
    Mesh(#[from] MeshError),
}

fn shader_path(name: &str) -> PathBuf {
    Path::new(env!("VIEWER_SHADER_DIR")).join(name)
}

fn load_config() -> Result<EngineConfig, FrameError> {
    if Path::new(CONFIG_PATH).exists() {
        log::info!("Loading configuration from {CONFIG_PATH}");
        Ok(EngineConfig::load(CONFIG_PATH)?)
    } else {
        log::info!("No {CONFIG_PATH} found, using defaults");
        Ok(EngineConfig::default())
    }
}

fn build_scene(frames: &mut FrameOrchestrator<VulkanDevice>) -> Result<(), ViewerError> {
    let material = frames.create_material(
        "defaultmesh",
        &PipelineDesc::new(shader_path("tri_mesh.vert.spv"), shader_path("default_lit.frag.spv")),
    )?;

    if Path::new(MONKEY_PATH).exists() {
        let monkey = Mesh::load_from_obj(MONKEY_PATH)?;
        let monkey = frames.upload_geometry("monkey", &monkey)?;
        frames.add_renderable(RenderableEntry::new(monkey, material, Matrix4::identity()))?;
    } else {
        log::warn!("{MONKEY_PATH} not found, drawing the triangle grid only");
    }

    let triangle = frames.upload_geometry("triangle", &Mesh::triangle())?;
    let scale = Matrix4::new_scaling(0.2);
    for x in -GRID_HALF_EXTENT..GRID_HALF_EXTENT {
        for y in -GRID_HALF_EXTENT..GRID_HALF_EXTENT {
            let translation = Matrix4::new_translation(&Vector3::new(x as f32, 0.0, y as f32));
            frames.add_renderable(RenderableEntry::new(triangle, material, translation * scale))?;
        }
    }
    frames.sort_renderables();

    log::info!("Scene built with {} renderables", frames.renderables().len());
    Ok(())
}

fn run() -> Result<u64, ViewerError> {
    let config = load_config()?;
    let mut window = Window::new(&config.application_name, config.window_extent)?;
    let device = VulkanDevice::new(&mut window, &config)?;
    let mut frames = FrameOrchestrator::init(device, config)?;

    build_scene(&mut frames)?;

    let drawn = frames.run(|| {
        window.poll_events();
        let mut escape = false;
        for (_, event) in window.flush_events() {
            if let WindowEvent::Key(Key::Escape, _, Action::Press, _) = event {
                escape = true;
            }
        }
        if escape {
            window.set_should_close(true);
        }
        window.should_close()
    });

    // Cleanup runs whether or not the loop failed
    let cleanup = frames.cleanup();
    let drawn = drawn?;
    cleanup?;
    Ok(drawn)
}

fn main() -> ExitCode {
    logging::init();
    log::info!("Starting mesh grid viewer");

    match run() {
        Ok(frames) => {
            log::info!("Viewer exited cleanly after {frames} frames");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("Viewer failed: {err}");
            ExitCode::FAILURE
        }
    }
}
