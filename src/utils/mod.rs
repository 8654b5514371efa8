pub mod logger;
pub mod notify;
pub mod progress;
