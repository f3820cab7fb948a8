pub mod events;
pub mod grid;
pub mod vehicle;
pub mod vehicle_api;

pub use events::*;
pub use grid::*;
pub use vehicle::*;
pub use vehicle_api::*;
