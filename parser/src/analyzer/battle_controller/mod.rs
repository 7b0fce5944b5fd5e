mod controller;
mod model;
mod timeline;

pub use controller::*;
pub use model::*;
pub use timeline::*;
