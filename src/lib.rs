//! Guides a user through a task on a live web page, one step at a time.
//!
//! A task is an ordered list of steps. For the current step the engine finds
//! the target element (possibly inside nested shadow roots), draws a
//! highlight with the instruction next to it, and watches for the action
//! that completes the step. Progress is persisted so a task survives page
//! navigations and resumes wherever its URL scope matches.

pub mod browser;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod engine;
pub mod error;
pub mod guide;
pub mod locator;
pub mod message;
pub mod page;
pub mod panel;
pub mod sink;
pub mod store;
pub mod task;

pub use catalog::TaskCatalog;
pub use coordinator::{Coordinator, Host};
pub use engine::{EngineConfig, EngineHandle, EngineLinks, spawn_engine};
pub use store::{JsonFileStore, MemoryStore, ProgressState, ProgressStore, SettingsStore};
pub use task::{ActionType, SelectorSpec, Step, Task};
