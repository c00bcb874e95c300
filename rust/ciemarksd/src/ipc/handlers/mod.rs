pub mod core;
pub mod lifecycle;
pub mod marks;
pub mod notifications;
pub mod roster;
pub mod setup;
