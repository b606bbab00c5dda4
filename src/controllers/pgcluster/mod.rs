mod controller;
pub mod diff;
mod quantity;
pub mod statefulset;

pub use controller::PgClusterReconciler;
