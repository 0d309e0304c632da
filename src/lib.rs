pub mod admission;
pub mod app;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod quota;
pub mod scheduler;
pub mod server;
pub mod trace;

// Re-export commonly used types
pub use app::App;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use errors::{LimiterError, Result};
pub use server::{router, start_server};
