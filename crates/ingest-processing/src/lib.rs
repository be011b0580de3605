pub mod categorization;
pub mod error;
pub mod events;
pub mod notifier;
pub mod stage;
pub mod throttle;
