pub mod eval;
pub mod events;
pub mod goals;
pub mod status;
pub mod stream;
pub mod utils;
