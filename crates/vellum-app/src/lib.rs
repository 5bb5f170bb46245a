//! Application framework for Vellum.
//!
//! This crate owns the boilerplate around the frame loop:
//! - Window creation and the winit event loop
//! - Vulkan context, swapchain and frame synchronizer setup
//! - Logging initialization
//! - Teardown in dependency order
//!
//! # Example
//!
//! ```no_run
//! use vellum_app::{run_app, AppConfig, AppContext, FrameContext, VellumApp};
//!
//! struct MyApp;
//!
//! impl VellumApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &AppContext, _frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::VellumApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

pub use vellum_gpu::{GpuAllocator, RenderTarget};
pub use winit::event::WindowEvent;
