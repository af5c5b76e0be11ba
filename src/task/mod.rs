//! Task definitions, profiles, and the stores that resolve them.

pub mod model;
pub mod profile;
pub mod store;

pub use model::{ErrorPolicy, ScrollDirection, Step, StepAction, Task, TaskSettings};
pub use profile::{Profile, ProfileRef};
pub use store::{InMemoryProfileStore, InMemoryTaskStore, ProfileStore, TaskStore};
