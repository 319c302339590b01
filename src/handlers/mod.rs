//! Event handlers for transaction lifecycle notifications

pub mod console;
pub mod telegram;
pub mod composite;

// Re-export for convenience
pub use console::ConsoleEventHandler;
pub use telegram::TelegramEventHandler;
pub use composite::CompositeEventHandler;
